//! On-chain event listener for the VRF coordinator.
//!
//! Two complementary strategies ensure no requests are missed:
//!
//! 1. **Catch-up scan** ([`catch_up_pending_requests`]): on startup, queries
//!    `getProgramAccounts` for request PDAs still marked pending, which
//!    covers requests made while the backend was offline.
//!
//! 2. **Live stream** ([`listen_for_events`]): subscribes to coordinator logs
//!    via WebSocket, parses `RandomWordsRequested` Anchor events, and
//!    reconnects on disconnection.
//!
//! A request can arrive through both paths; the fulfiller treats the second
//! fulfillment attempt as non-retryable.

use base64::Engine;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionLogsConfig,
    RpcTransactionLogsFilter,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::anchor::{account_discriminator, event_discriminator, Reader};
use crate::config::AppConfig;
use crate::fulfiller::FulfillmentJob;
use crate::metrics::Metrics;

/// A randomness request, from either the event or the request PDA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomWordsRequestedEvent {
    pub request_id: u64,
    pub subscription_id: u64,
    pub consumer_program: Pubkey,
    pub requester: Pubkey,
    pub key_hash: [u8; 32],
    pub request_confirmations: u16,
    pub callback_compute_limit: u32,
    pub num_words: u32,
    pub seed: [u8; 32],
    pub request_slot: u64,
}

impl RandomWordsRequestedEvent {
    /// First slot at which the coordinator accepts the fulfillment.
    pub fn fulfillable_from_slot(&self) -> u64 {
        self.request_slot
            .saturating_add(u64::from(self.request_confirmations))
    }
}

/// Delay before reconnecting to the WebSocket after a disconnect or error.
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Borsh size of the shared request body (event payload and the leading
/// fields of the request PDA).
const REQUEST_BODY_LEN: usize = 162;

/// Offset of the status byte in `RandomnessRequest` account data:
/// discriminator (8) + request body (162).
const REQUEST_STATUS_OFFSET: usize = 8 + REQUEST_BODY_LEN;

const STATUS_PENDING: u8 = 0;

/// Scan for request PDAs that are still pending and queue them.
pub async fn catch_up_pending_requests(
    config: &AppConfig,
    tx: &mpsc::Sender<FulfillmentJob>,
    metrics: &Metrics,
) {
    info!("Scanning for pending requests");

    let client = RpcClient::new(config.rpc_url.clone());
    let disc = account_discriminator("RandomnessRequest");

    let filters = vec![
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(0, disc.to_vec())),
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
            REQUEST_STATUS_OFFSET,
            vec![STATUS_PENDING],
        )),
    ];

    let account_config = RpcProgramAccountsConfig {
        filters: Some(filters),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    let accounts = match client
        .get_program_ui_accounts_with_config(&config.coordinator_program_id, account_config)
        .await
    {
        Ok(accounts) => accounts,
        Err(e) => {
            error!(error = %e, "Failed to fetch program accounts");
            return;
        }
    };

    info!(count = accounts.len(), "Found pending requests");
    for (pubkey, ui_account) in accounts {
        let Some(data) = ui_account.data.decode() else {
            warn!(account = %pubkey, "Failed to decode account data, skipping");
            continue;
        };

        let Some(event) = data.get(8..).and_then(parse_request_body) else {
            warn!(account = %pubkey, len = data.len(), "Malformed request account, skipping");
            continue;
        };

        info!(
            request_id = event.request_id,
            consumer = %event.consumer_program,
            slot = event.request_slot,
            "Queued pending request"
        );

        metrics.record_request();
        if tx.send(FulfillmentJob::new(event)).await.is_err() {
            error!("Channel closed while catching up pending requests");
            return;
        }
    }
}

/// Subscribe to coordinator logs via WebSocket and forward
/// `RandomWordsRequested` events to the fulfiller. Reconnects forever.
pub async fn listen_for_events(
    config: AppConfig,
    tx: mpsc::Sender<FulfillmentJob>,
    metrics: Arc<Metrics>,
) {
    let discriminator = event_discriminator("RandomWordsRequested");

    loop {
        info!(url = %config.ws_url, "Connecting to WebSocket");

        match PubsubClient::new(&config.ws_url).await {
            Ok(pubsub) => {
                info!("WebSocket connected");

                let filter = RpcTransactionLogsFilter::Mentions(vec![
                    config.coordinator_program_id.to_string(),
                ]);
                let logs_config = RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                };

                match pubsub.logs_subscribe(filter, logs_config).await {
                    Ok((mut stream, _unsub)) => {
                        use futures_util::StreamExt;
                        while let Some(log_result) = stream.next().await {
                            for event in extract_events(&log_result.value.logs, &discriminator) {
                                info!(
                                    request_id = event.request_id,
                                    consumer = %event.consumer_program,
                                    num_words = event.num_words,
                                    slot = event.request_slot,
                                    "Received RandomWordsRequested event"
                                );
                                metrics.record_request();
                                if tx.send(FulfillmentJob::new(event)).await.is_err() {
                                    error!("Channel closed, stopping listener");
                                    return;
                                }
                            }
                        }
                        warn!("WebSocket stream ended, reconnecting");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to subscribe to logs");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to WebSocket");
            }
        }

        info!(delay = ?WS_RECONNECT_DELAY, "Reconnecting");
        tokio::time::sleep(WS_RECONNECT_DELAY).await;
    }
}

/// Pull every `RandomWordsRequested` event out of one transaction's logs.
///
/// Anchor emits events as base64 `Program data:` lines: an 8-byte
/// discriminator followed by the Borsh body.
fn extract_events(logs: &[String], discriminator: &[u8; 8]) -> Vec<RandomWordsRequestedEvent> {
    let mut events = Vec::new();
    for log_line in logs {
        let Some(data_str) = log_line.strip_prefix("Program data: ") else {
            continue;
        };

        let decoded = match base64::engine::general_purpose::STANDARD.decode(data_str.trim()) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "Failed to decode base64 log data");
                continue;
            }
        };

        let Some(body) = decoded.strip_prefix(discriminator) else {
            continue;
        };

        match parse_request_body(body) {
            Some(event) => events.push(event),
            None => warn!("Failed to parse RandomWordsRequested event payload"),
        }
    }
    events
}

/// Decode the request body shared by the event and the request PDA.
fn parse_request_body(data: &[u8]) -> Option<RandomWordsRequestedEvent> {
    let mut r = Reader::new(data);
    Some(RandomWordsRequestedEvent {
        request_id: r.u64()?,
        subscription_id: r.u64()?,
        consumer_program: r.pubkey()?,
        requester: r.pubkey()?,
        key_hash: r.array()?,
        request_confirmations: r.u16()?,
        callback_compute_limit: r.u32()?,
        num_words: r.u32()?,
        seed: r.array()?,
        request_slot: r.u64()?,
    })
}
