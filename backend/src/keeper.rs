//! Upkeep keeper: polls the raffle and triggers `perform_upkeep` once a draw
//! is due.
//!
//! Readiness is judged against the cluster's Clock sysvar rather than local
//! time, so the keeper and the program agree on when the interval has
//! passed. A lost race (another keeper, or entries reset between poll and
//! send) surfaces as `UpkeepNotNeeded` and is retried on the next poll.

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer;
use solana_sdk::sysvar;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::anchor::{account_discriminator, instruction_discriminator, Reader};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::raffle_accounts::{
    consumer_authority_pda, consumer_registration_pda, coordinator_config_pda, raffle_pda,
    request_pda, subscription_pda, RaffleSnapshot,
};
use crate::transaction::{send_with_retries, set_compute_unit_price, RetryPolicy};

/// `Clock::unix_timestamp` offset: slot, epoch_start_timestamp, epoch and
/// leader_schedule_epoch precede it.
const CLOCK_UNIX_TIMESTAMP_OFFSET: usize = 32;

/// `CoordinatorConfig::request_counter` offset: discriminator, admin,
/// authority, key_hash, fee_per_word, max_num_words.
const REQUEST_COUNTER_OFFSET: usize = 8 + 32 + 32 + 32 + 8 + 4;

const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::new_from_array([0u8; 32]);

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Triggered { request_id: u64 },
}

pub async fn run_keeper(config: AppConfig, metrics: Arc<Metrics>) {
    let rpc_client = RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::confirmed(),
    );

    info!(
        keeper = %config.keeper_keypair.pubkey(),
        interval = ?config.keeper_poll_interval,
        "Keeper started"
    );

    let mut ticker = tokio::time::interval(config.keeper_poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match poll_once(&rpc_client, &config, &metrics).await {
            Ok(PollOutcome::Idle) => {}
            Ok(PollOutcome::Triggered { request_id }) => {
                metrics.record_upkeep();
                info!(request_id, "Draw requested");
            }
            Err(e) => {
                let err_str = format!("{e:#}");
                if err_str.contains("UpkeepNotNeeded") {
                    debug!(reason = %err_str, "Upkeep raced, will re-check next poll");
                } else {
                    metrics.record_upkeep_failure();
                    error!(error = %err_str, "Keeper poll failed");
                }
            }
        }
    }
}

#[instrument(skip_all)]
async fn poll_once(
    rpc_client: &RpcClient,
    config: &AppConfig,
    metrics: &Metrics,
) -> Result<PollOutcome> {
    let raffle_address = raffle_pda(&config.raffle_program_id);
    let raffle_account = rpc_client
        .get_account(&raffle_address)
        .await
        .with_context(|| format!("failed to fetch raffle account {raffle_address}"))?;
    let raffle = RaffleSnapshot::decode(&raffle_account.data)?;

    let clock = rpc_client
        .get_account(&sysvar::clock::ID)
        .await
        .context("failed to fetch clock sysvar")?;
    let now = clock_unix_timestamp(&clock.data).context("malformed clock sysvar")?;
    metrics.record_poll(now);

    if !raffle.upkeep_needed(now) {
        debug!(
            state = ?raffle.state,
            players = raffle.player_count(),
            pool = raffle.pool,
            seconds_left = raffle.interval.saturating_sub(now.saturating_sub(raffle.last_timestamp)),
            "Upkeep not needed"
        );
        return Ok(PollOutcome::Idle);
    }

    let config_address = coordinator_config_pda(&config.coordinator_program_id);
    if raffle.coordinator_config != config_address {
        warn!(
            raffle = %raffle.coordinator_config,
            expected = %config_address,
            "Raffle is bound to a different coordinator"
        );
    }
    let coordinator_config = rpc_client
        .get_account(&raffle.coordinator_config)
        .await
        .context("failed to fetch coordinator config")?;
    let request_id = request_counter(&coordinator_config.data)?;

    info!(
        request_id,
        players = raffle.player_count(),
        pool = raffle.pool,
        round = raffle.round,
        "Upkeep needed, triggering draw"
    );

    let mut instructions = Vec::with_capacity(2);
    if config.priority_fee_micro_lamports > 0 {
        instructions.push(set_compute_unit_price(config.priority_fee_micro_lamports));
    }
    instructions.push(build_perform_upkeep_instruction(
        &config.raffle_program_id,
        &config.coordinator_program_id,
        &config.keeper_keypair.pubkey(),
        &raffle,
        request_id,
    ));

    let policy = RetryPolicy {
        max_retries: config.max_retries,
        initial_delay: Duration::from_millis(config.initial_retry_delay_ms),
    };
    let sig = send_with_retries(rpc_client, &config.keeper_keypair, &instructions, policy).await?;
    info!(signature = %sig, explorer = %config.explorer_url(&sig), "perform_upkeep confirmed");

    Ok(PollOutcome::Triggered { request_id })
}

fn clock_unix_timestamp(data: &[u8]) -> Option<i64> {
    let mut r = Reader::new(data.get(CLOCK_UNIX_TIMESTAMP_OFFSET..)?);
    r.i64()
}

/// The id the coordinator will assign to the next request.
fn request_counter(data: &[u8]) -> Result<u64> {
    anyhow::ensure!(
        data.starts_with(&account_discriminator("CoordinatorConfig")),
        "account is not a CoordinatorConfig"
    );
    let mut r = Reader::new(data.get(REQUEST_COUNTER_OFFSET..).unwrap_or_default());
    r.u64().context("coordinator config truncated")
}

/// Build the raffle's `perform_upkeep` with an empty `perform_data`.
///
/// `request_id` must be the coordinator's current counter; it seeds the
/// request PDA the coordinator creates during the CPI.
fn build_perform_upkeep_instruction(
    raffle_program: &Pubkey,
    coordinator_program: &Pubkey,
    keeper: &Pubkey,
    raffle: &RaffleSnapshot,
    request_id: u64,
) -> Instruction {
    let mut data = Vec::with_capacity(8 + 4);
    data.extend_from_slice(&instruction_discriminator("perform_upkeep"));
    data.extend_from_slice(&0u32.to_le_bytes());

    let accounts = vec![
        AccountMeta::new(*keeper, true),
        AccountMeta::new(raffle_pda(raffle_program), false),
        AccountMeta::new_readonly(consumer_authority_pda(raffle_program), false),
        AccountMeta::new(raffle.coordinator_config, false),
        AccountMeta::new(subscription_pda(coordinator_program, raffle.subscription_id), false),
        AccountMeta::new_readonly(
            consumer_registration_pda(coordinator_program, raffle.subscription_id, raffle_program),
            false,
        ),
        AccountMeta::new(request_pda(coordinator_program, request_id), false),
        AccountMeta::new_readonly(*raffle_program, false),
        AccountMeta::new_readonly(*coordinator_program, false),
        AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
    ];

    Instruction {
        program_id: *raffle_program,
        accounts,
        data,
    }
}
