//! Fulfillment engine: consumes randomness request events and submits
//! fulfillment transactions carrying an Ed25519 proof. The coordinator
//! verifies the proof, expands the randomness and calls back into the raffle.
//!
//! Each fulfillment transaction contains:
//! 1. A native Ed25519 signature-verify instruction (proof of VRF output).
//! 2. A `set_compute_unit_limit` sized for the consumer's callback.
//! 3. (Optional) A `set_compute_unit_price` instruction for priority fees.
//! 4. The coordinator's `fulfill_random_words`, followed by the callback's
//!    accounts.

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::sysvar;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::anchor::instruction_discriminator;
use crate::config::AppConfig;
use crate::listener::RandomWordsRequestedEvent;
use crate::metrics::Metrics;
use crate::raffle_accounts::{
    callback_accounts, coordinator_config_pda, raffle_pda, request_pda, RaffleSnapshot,
};
use crate::transaction::{send_with_retries, set_compute_unit_limit, set_compute_unit_price, RetryPolicy};
use crate::vrf::{compute_randomness, fulfillment_message, key_hash};

/// Compute units the coordinator spends around the callback CPI.
const FULFILL_OVERHEAD_UNITS: u32 = 60_000;

const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Tries per request, counting the first. A request given up on stays pending
/// on chain and is picked up again by the startup catch-up scan.
const MAX_FULFILL_ATTEMPTS: u32 = 5;
const REQUEUE_BASE_DELAY: Duration = Duration::from_secs(2);
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Anchor error names that no retry can fix. Matched as `Error Code: <name>`
/// in the program logs, since numeric codes overlap between the coordinator
/// and the raffle callback.
const NON_RETRYABLE_ERRORS: [&str; 4] = [
    // Coordinator: already fulfilled.
    "RequestNotPending",
    // Coordinator: signer is not the configured oracle.
    "Unauthorized",
    // Request PDA already closed.
    "AccountNotInitialized",
    // Raffle is waiting on a different request.
    "RequestIdMismatch",
];

const FOREIGN_KEY_HASH: &str = "request names a different oracle key";

/// A request on its way to the fulfiller, with the number of failed tries
/// behind it.
#[derive(Debug, Clone)]
pub struct FulfillmentJob {
    pub event: RandomWordsRequestedEvent,
    pub attempt: u32,
}

impl FulfillmentJob {
    pub fn new(event: RandomWordsRequestedEvent) -> Self {
        Self { event, attempt: 0 }
    }

    fn retry(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

/// What happens to a job after a failed try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Skip,
    Requeue(Duration),
    GiveUp,
}

fn is_non_retryable(err_str: &str) -> bool {
    err_str.contains(FOREIGN_KEY_HASH)
        || NON_RETRYABLE_ERRORS
            .iter()
            .any(|name| err_str.contains(&format!("Error Code: {name}.")))
}

fn disposition(err_str: &str, attempt: u32) -> Disposition {
    if is_non_retryable(err_str) {
        Disposition::Skip
    } else if attempt + 1 >= MAX_FULFILL_ATTEMPTS {
        Disposition::GiveUp
    } else {
        Disposition::Requeue(requeue_delay(attempt))
    }
}

fn requeue_delay(attempt: u32) -> Duration {
    REQUEUE_BASE_DELAY
        .saturating_mul(1 << attempt.min(16))
        .min(REQUEUE_MAX_DELAY)
}

/// Main fulfiller loop. Retryable failures go back onto the queue through
/// `requeue`, which does not keep the channel open on its own.
pub async fn run_fulfiller(
    config: AppConfig,
    mut rx: mpsc::Receiver<FulfillmentJob>,
    requeue: mpsc::WeakSender<FulfillmentJob>,
    pending_count: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
) {
    let rpc_client = Arc::new(RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::confirmed(),
    ));

    let semaphore = Arc::new(Semaphore::new(config.fulfillment_concurrency));

    while let Some(job) = rx.recv().await {
        pending_count.fetch_add(1, Ordering::Relaxed);

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed, stopping fulfiller");
                break;
            }
        };
        let rpc = rpc_client.clone();
        let cfg = config.clone();
        let pending = pending_count.clone();
        let met = metrics.clone();
        let requeue = requeue.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let start = Instant::now();
            let event = &job.event;

            info!(
                request_id = event.request_id,
                consumer = %event.consumer_program,
                num_words = event.num_words,
                slot = event.request_slot,
                attempt = job.attempt + 1,
                "Fulfilling randomness request"
            );

            match fulfill_request(&rpc, &cfg, event).await {
                Ok(sig) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    met.record_fulfillment(latency_ms);
                    info!(
                        request_id = event.request_id,
                        signature = %sig,
                        latency_ms,
                        explorer = %cfg.explorer_url(&sig),
                        "Fulfilled successfully"
                    );
                }
                Err(e) => handle_fulfillment_error(job, e, requeue, &met),
            }

            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    info!("Fulfiller channel closed, shutting down");
}

fn handle_fulfillment_error(
    job: FulfillmentJob,
    error: anyhow::Error,
    requeue: mpsc::WeakSender<FulfillmentJob>,
    metrics: &Metrics,
) {
    let request_id = job.event.request_id;
    let err_str = format!("{error:#}");
    match disposition(&err_str, job.attempt) {
        Disposition::Skip => {
            metrics.record_skip();
            warn!(request_id, reason = %err_str, "Skipping request (non-retryable)");
        }
        Disposition::GiveUp => {
            metrics.record_failure();
            error!(
                request_id,
                attempts = job.attempt + 1,
                error = %err_str,
                "Giving up on request"
            );
        }
        Disposition::Requeue(delay) => {
            metrics.record_requeue();
            warn!(request_id, attempt = job.attempt + 1, ?delay, error = %err_str, "Fulfillment failed, requeueing");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(sender) = requeue.upgrade() else {
                    debug!(request_id, "Queue closed, dropping retry");
                    return;
                };
                if sender.send(job.retry()).await.is_err() {
                    debug!(request_id, "Queue closed, dropping retry");
                }
            });
        }
    }
}

/// Build, sign, and submit a fulfillment transaction with callback.
#[instrument(skip_all, fields(request_id = event.request_id))]
async fn fulfill_request(
    rpc_client: &RpcClient,
    config: &AppConfig,
    event: &RandomWordsRequestedEvent,
) -> Result<String> {
    let authority = config.authority_keypair.as_ref();
    anyhow::ensure!(event.key_hash == key_hash(&authority.pubkey()), FOREIGN_KEY_HASH);

    wait_for_slot(rpc_client, event.fulfillable_from_slot()).await?;

    let randomness = compute_randomness(
        &config.hmac_secret,
        &event.seed,
        event.request_slot,
        event.request_id,
    );

    let callback_remaining = if event.consumer_program == config.raffle_program_id {
        let raffle = fetch_raffle(rpc_client, &config.raffle_program_id).await?;
        debug!(
            players = raffle.player_count(),
            pending = ?raffle.pending_request_id,
            "Loaded raffle for callback"
        );
        if raffle.pending_request_id != Some(event.request_id) {
            warn!(
                pending = ?raffle.pending_request_id,
                "Raffle is not waiting on this request, callback will be rejected"
            );
        }
        callback_accounts(&config.raffle_program_id, &raffle, &randomness)?
    } else {
        warn!(consumer = %event.consumer_program, "Unknown consumer, sending no callback accounts");
        Vec::new()
    };

    let message = fulfillment_message(event.request_id, &randomness);

    // The coordinator reads the proof from instruction 0.
    let mut instructions = Vec::with_capacity(4);
    instructions.push(build_ed25519_instruction(authority, &message));
    instructions.push(set_compute_unit_limit(
        event
            .callback_compute_limit
            .saturating_add(FULFILL_OVERHEAD_UNITS),
    ));
    if config.priority_fee_micro_lamports > 0 {
        instructions.push(set_compute_unit_price(config.priority_fee_micro_lamports));
    }
    instructions.push(build_fulfill_instruction(
        &config.coordinator_program_id,
        &authority.pubkey(),
        event,
        &randomness,
        &callback_remaining,
    ));

    let policy = RetryPolicy {
        max_retries: config.max_retries,
        initial_delay: Duration::from_millis(config.initial_retry_delay_ms),
    };
    send_with_retries(rpc_client, authority, &instructions, policy)
        .await
        .with_context(|| format!("request_id={}", event.request_id))
}

async fn fetch_raffle(rpc_client: &RpcClient, raffle_program: &Pubkey) -> Result<RaffleSnapshot> {
    let address = raffle_pda(raffle_program);
    let account = rpc_client
        .get_account(&address)
        .await
        .with_context(|| format!("failed to fetch raffle account {address}"))?;
    RaffleSnapshot::decode(&account.data)
}

/// Block until the cluster reaches `target` so the coordinator's
/// confirmation check passes.
async fn wait_for_slot(rpc_client: &RpcClient, target: u64) -> Result<()> {
    loop {
        let slot = rpc_client.get_slot().await.context("failed to fetch slot")?;
        if slot >= target {
            return Ok(());
        }
        debug!(slot, target, "Waiting for request confirmations");
        tokio::time::sleep(SLOT_POLL_INTERVAL).await;
    }
}

/// Construct a native Ed25519 signature-verify instruction.
fn build_ed25519_instruction(keypair: &Keypair, message: &[u8]) -> Instruction {
    use solana_sdk::ed25519_program;

    let signature = keypair.sign_message(message);
    let pubkey = keypair.pubkey();

    const DATA_START: usize = 2 + 7 * 2; // 16
    let public_key_offset: u16 = DATA_START as u16;
    let signature_offset: u16 = (DATA_START + 32) as u16;
    let message_data_offset: u16 = (DATA_START + 32 + 64) as u16;
    let message_data_size: u16 = message.len() as u16;

    let mut data = Vec::with_capacity(DATA_START + 32 + 64 + message.len());

    data.push(1u8); // num_signatures
    data.push(0u8); // padding

    // u16::MAX: the bytes live in this instruction.
    data.extend_from_slice(&signature_offset.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(&public_key_offset.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(&message_data_offset.to_le_bytes());
    data.extend_from_slice(&message_data_size.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());

    data.extend_from_slice(&pubkey.to_bytes());
    data.extend_from_slice(signature.as_ref());
    data.extend_from_slice(message);

    Instruction {
        program_id: ed25519_program::id(),
        accounts: vec![],
        data,
    }
}

/// Build the coordinator's `fulfill_random_words` instruction.
fn build_fulfill_instruction(
    coordinator_program: &Pubkey,
    authority: &Pubkey,
    event: &RandomWordsRequestedEvent,
    randomness: &[u8; 32],
    callback_remaining: &[AccountMeta],
) -> Instruction {
    let mut data = Vec::with_capacity(8 + 8 + 32);
    data.extend_from_slice(&instruction_discriminator("fulfill_random_words"));
    data.extend_from_slice(&event.request_id.to_le_bytes());
    data.extend_from_slice(randomness);

    let mut accounts = vec![
        AccountMeta::new(*authority, true),
        AccountMeta::new_readonly(coordinator_config_pda(coordinator_program), false),
        AccountMeta::new(request_pda(coordinator_program, event.request_id), false),
        AccountMeta::new(event.requester, false),
        AccountMeta::new_readonly(event.consumer_program, false),
        AccountMeta::new_readonly(sysvar::instructions::ID, false),
    ];
    accounts.extend_from_slice(callback_remaining);

    Instruction {
        program_id: *coordinator_program,
        accounts,
        data,
    }
}
