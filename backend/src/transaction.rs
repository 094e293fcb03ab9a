//! Transaction submission shared by the fulfiller and the keeper.

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use std::time::Duration;
use tracing::warn;

/// `ComputeBudget111111111111111111111111111111`
const COMPUTE_BUDGET_PROGRAM_ID: Pubkey = Pubkey::new_from_array([
    3, 6, 70, 111, 229, 33, 23, 50, 255, 236, 173, 186, 114, 195, 155, 231, 188, 140, 229, 187,
    197, 247, 18, 107, 44, 67, 155, 58, 64, 0, 0, 0,
]);

/// Upper bound the runtime accepts for a single transaction.
pub const MAX_COMPUTE_UNIT_LIMIT: u32 = 1_400_000;

/// Retry policy for [`send_with_retries`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

/// Sign with `payer` and send, backing off exponentially on BlockhashNotFound.
/// Any other error is returned immediately.
pub async fn send_with_retries(
    rpc_client: &RpcClient,
    payer: &Keypair,
    instructions: &[Instruction],
    policy: RetryPolicy,
) -> Result<String> {
    let mut retry_delay = policy.initial_delay;

    for attempt in 0..policy.max_retries {
        let blockhash = rpc_client
            .get_latest_blockhash()
            .await
            .context("failed to fetch latest blockhash")?;

        let tx = Transaction::new_signed_with_payer(
            instructions,
            Some(&payer.pubkey()),
            &[payer],
            blockhash,
        );

        match rpc_client.send_and_confirm_transaction(&tx).await {
            Ok(sig) => return Ok(sig.to_string()),
            Err(e)
                if e.to_string().contains("BlockhashNotFound")
                    && attempt + 1 < policy.max_retries =>
            {
                warn!(
                    attempt = attempt + 1,
                    delay = ?retry_delay,
                    "BlockhashNotFound, retrying"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay = next_delay(retry_delay);
            }
            Err(e) => return Err(e).context("send_and_confirm_transaction failed"),
        }
    }

    anyhow::bail!("max retries ({}) exceeded", policy.max_retries)
}

fn next_delay(delay: Duration) -> Duration {
    delay.saturating_mul(2).min(Duration::from_secs(60))
}

/// `ComputeBudgetInstruction::SetComputeUnitLimit`.
pub fn set_compute_unit_limit(units: u32) -> Instruction {
    let mut data = Vec::with_capacity(5);
    data.push(2u8);
    data.extend_from_slice(&units.min(MAX_COMPUTE_UNIT_LIMIT).to_le_bytes());
    Instruction {
        program_id: COMPUTE_BUDGET_PROGRAM_ID,
        accounts: vec![],
        data,
    }
}

/// `ComputeBudgetInstruction::SetComputeUnitPrice`.
pub fn set_compute_unit_price(micro_lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(9);
    data.push(3u8);
    data.extend_from_slice(&micro_lamports.to_le_bytes());
    Instruction {
        program_id: COMPUTE_BUDGET_PROGRAM_ID,
        accounts: vec![],
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_delay(Duration::from_millis(500)), Duration::from_secs(1));
        assert_eq!(next_delay(Duration::from_secs(45)), Duration::from_secs(60));
    }

    #[test]
    fn compute_budget_program_id() {
        assert_eq!(
            COMPUTE_BUDGET_PROGRAM_ID.to_string(),
            "ComputeBudget111111111111111111111111111111"
        );
    }

    #[test]
    fn compute_budget_encoding() {
        let limit = set_compute_unit_limit(300_000);
        assert_eq!(limit.program_id, COMPUTE_BUDGET_PROGRAM_ID);
        assert_eq!(limit.data[0], 2);
        assert_eq!(&limit.data[1..], &300_000u32.to_le_bytes());

        let capped = set_compute_unit_limit(u32::MAX);
        assert_eq!(&capped.data[1..], &MAX_COMPUTE_UNIT_LIMIT.to_le_bytes());

        let price = set_compute_unit_price(5);
        assert_eq!(price.data, [3, 5, 0, 0, 0, 0, 0, 0, 0]);
    }
}
