//! Off-chain view of the raffle program.
//!
//! The fulfiller must name the winner's account in the callback before the
//! raffle has picked it, so it re-runs the on-chain draw here: decode the
//! raffle PDA, expand the oracle randomness, reduce the first word modulo the
//! player count. The keeper uses the same snapshot to evaluate the upkeep
//! predicate without simulating `check_upkeep`.

use anyhow::{bail, Context, Result};
use solana_sdk::instruction::AccountMeta;
use solana_sdk::pubkey::Pubkey;

use crate::anchor::{account_discriminator, Reader};
use crate::vrf::expand_randomness;

pub const RAFFLE_SEED: &[u8] = b"raffle";
pub const CONSUMER_AUTHORITY_SEED: &[u8] = b"vrf-consumer";
pub const COORDINATOR_CONFIG_SEED: &[u8] = b"coordinator-config";
pub const SUBSCRIPTION_SEED: &[u8] = b"subscription";
pub const CONSUMER_SEED: &[u8] = b"consumer";
pub const REQUEST_SEED: &[u8] = b"request";

pub fn raffle_pda(raffle_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[RAFFLE_SEED], raffle_program).0
}

/// PDA the raffle signs `request_random_words` with.
pub fn consumer_authority_pda(raffle_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[CONSUMER_AUTHORITY_SEED], raffle_program).0
}

pub fn coordinator_config_pda(coordinator_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[COORDINATOR_CONFIG_SEED], coordinator_program).0
}

pub fn subscription_pda(coordinator_program: &Pubkey, subscription_id: u64) -> Pubkey {
    Pubkey::find_program_address(
        &[SUBSCRIPTION_SEED, &subscription_id.to_le_bytes()],
        coordinator_program,
    )
    .0
}

pub fn consumer_registration_pda(
    coordinator_program: &Pubkey,
    subscription_id: u64,
    consumer_program: &Pubkey,
) -> Pubkey {
    Pubkey::find_program_address(
        &[
            CONSUMER_SEED,
            &subscription_id.to_le_bytes(),
            consumer_program.as_ref(),
        ],
        coordinator_program,
    )
    .0
}

pub fn request_pda(coordinator_program: &Pubkey, request_id: u64) -> Pubkey {
    Pubkey::find_program_address(&[REQUEST_SEED, &request_id.to_le_bytes()], coordinator_program)
        .0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaffleState {
    Open,
    Calculating,
}

/// Decoded copy of the on-chain `Raffle` account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaffleSnapshot {
    pub authority: Pubkey,
    pub coordinator_config: Pubkey,
    pub key_hash: [u8; 32],
    pub subscription_id: u64,
    pub request_confirmations: u16,
    pub callback_compute_limit: u32,
    pub entrance_fee: u64,
    pub interval: i64,
    pub last_timestamp: i64,
    pub state: RaffleState,
    pub pending_request_id: Option<u64>,
    pub recent_winner: Pubkey,
    pub last_random_word: [u8; 32],
    pub pool: u64,
    pub round: u64,
    pub players: Vec<Pubkey>,
}

impl RaffleSnapshot {
    /// Decode the raw account data, discriminator included.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let Some(body) = data.strip_prefix(&account_discriminator("Raffle")) else {
            bail!("account is not a Raffle (discriminator mismatch)");
        };
        Self::decode_body(body).context("raffle account data truncated or malformed")
    }

    fn decode_body(body: &[u8]) -> Option<Self> {
        let mut r = Reader::new(body);
        let authority = r.pubkey()?;
        let coordinator_config = r.pubkey()?;
        let key_hash = r.array()?;
        let subscription_id = r.u64()?;
        let request_confirmations = r.u16()?;
        let callback_compute_limit = r.u32()?;
        let entrance_fee = r.u64()?;
        let interval = r.i64()?;
        let last_timestamp = r.i64()?;
        let state = match r.u8()? {
            0 => RaffleState::Open,
            1 => RaffleState::Calculating,
            _ => return None,
        };
        let pending_request_id = r.option_u64()?;
        let recent_winner = r.pubkey()?;
        let last_random_word = r.array()?;
        let pool = r.u64()?;
        let round = r.u64()?;
        let _bump = r.u8()?;
        let _vrf_consumer_bump = r.u8()?;
        let players = r.pubkey_vec()?;

        Some(Self {
            authority,
            coordinator_config,
            key_hash,
            subscription_id,
            request_confirmations,
            callback_compute_limit,
            entrance_fee,
            interval,
            last_timestamp,
            state,
            pending_request_id,
            recent_winner,
            last_random_word,
            pool,
            round,
            players,
        })
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Mirror of the program's upkeep predicate at chain time `now`.
    pub fn upkeep_needed(&self, now: i64) -> bool {
        let interval_passed = now.saturating_sub(self.last_timestamp) >= self.interval;
        self.state == RaffleState::Open
            && interval_passed
            && self.pool > 0
            && !self.players.is_empty()
    }

    /// The player the raffle will pay for `randomness`.
    pub fn predicted_winner(&self, randomness: &[u8; 32]) -> Option<Pubkey> {
        if self.players.is_empty() {
            return None;
        }
        let words = expand_randomness(randomness, 1);
        let index = winner_index(&words[0], self.players.len());
        self.players.get(index).copied()
    }
}

/// Same reduction as the program: the word as a 256-bit big-endian integer
/// modulo `player_count`.
pub fn winner_index(word: &[u8; 32], player_count: usize) -> usize {
    let modulus = player_count as u128;
    word.iter()
        .fold(0u128, |acc, &byte| (acc * 256 + u128::from(byte)) % modulus) as usize
}

/// Remaining accounts for the raffle's `fulfill_random_words` callback: the
/// raffle PDA and the predicted winner, both writable.
pub fn callback_accounts(
    raffle_program: &Pubkey,
    raffle: &RaffleSnapshot,
    randomness: &[u8; 32],
) -> Result<Vec<AccountMeta>> {
    let winner = raffle
        .predicted_winner(randomness)
        .context("raffle has no players to draw from")?;
    Ok(vec![
        AccountMeta::new(raffle_pda(raffle_program), false),
        AccountMeta::new(winner, false),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Borsh image of a raffle account, field by field.
    fn encode(snapshot: &RaffleSnapshot) -> Vec<u8> {
        let mut data = account_discriminator("Raffle").to_vec();
        data.extend_from_slice(snapshot.authority.as_ref());
        data.extend_from_slice(snapshot.coordinator_config.as_ref());
        data.extend_from_slice(&snapshot.key_hash);
        data.extend_from_slice(&snapshot.subscription_id.to_le_bytes());
        data.extend_from_slice(&snapshot.request_confirmations.to_le_bytes());
        data.extend_from_slice(&snapshot.callback_compute_limit.to_le_bytes());
        data.extend_from_slice(&snapshot.entrance_fee.to_le_bytes());
        data.extend_from_slice(&snapshot.interval.to_le_bytes());
        data.extend_from_slice(&snapshot.last_timestamp.to_le_bytes());
        data.push(match snapshot.state {
            RaffleState::Open => 0,
            RaffleState::Calculating => 1,
        });
        match snapshot.pending_request_id {
            Some(id) => {
                data.push(1);
                data.extend_from_slice(&id.to_le_bytes());
            }
            None => data.push(0),
        }
        data.extend_from_slice(snapshot.recent_winner.as_ref());
        data.extend_from_slice(&snapshot.last_random_word);
        data.extend_from_slice(&snapshot.pool.to_le_bytes());
        data.extend_from_slice(&snapshot.round.to_le_bytes());
        data.push(254);
        data.push(253);
        data.extend_from_slice(&(snapshot.players.len() as u32).to_le_bytes());
        for player in &snapshot.players {
            data.extend_from_slice(player.as_ref());
        }
        data
    }

    /// Written by the program's own serializer tests.
    const RAFFLE_ACCOUNT_FIXTURE: &str = include_str!("../../fixtures/raffle_account.hex");
    const WINNER_DRAWS_FIXTURE: &str = include_str!("../../fixtures/winner_draws.txt");

    fn hex_bytes(hex: &str) -> Vec<u8> {
        hex.as_bytes()
            .chunks(2)
            .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap())
            .collect()
    }

    fn fixture_lines(text: &str) -> impl Iterator<Item = &str> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
    }

    fn fixture_snapshot() -> RaffleSnapshot {
        RaffleSnapshot {
            authority: Pubkey::new_from_array([1; 32]),
            coordinator_config: Pubkey::new_from_array([2; 32]),
            key_hash: [3; 32],
            subscription_id: 4,
            request_confirmations: 5,
            callback_compute_limit: 200_000,
            entrance_fee: 10_000_000,
            interval: 30,
            last_timestamp: 1_700_000_000,
            state: RaffleState::Calculating,
            pending_request_id: Some(17),
            recent_winner: Pubkey::new_from_array([6; 32]),
            last_random_word: [7; 32],
            pool: 20_000_000,
            round: 8,
            players: vec![Pubkey::new_from_array([9; 32]), Pubkey::new_from_array([10; 32])],
        }
    }

    fn snapshot(players: usize) -> RaffleSnapshot {
        RaffleSnapshot {
            authority: Pubkey::new_unique(),
            coordinator_config: Pubkey::new_unique(),
            key_hash: [4u8; 32],
            subscription_id: 1,
            request_confirmations: 3,
            callback_compute_limit: 200_000,
            entrance_fee: 10_000_000,
            interval: 30,
            last_timestamp: 1_700_000_000,
            state: RaffleState::Open,
            pending_request_id: None,
            recent_winner: Pubkey::default(),
            last_random_word: [0u8; 32],
            pool: 10_000_000 * players as u64,
            round: 0,
            players: (0..players).map(|_| Pubkey::new_unique()).collect(),
        }
    }

    #[test]
    fn decodes_open_raffle() {
        let expected = snapshot(3);
        // Anchor allocates for 100 players; trailing zeroes must be ignored.
        let mut data = encode(&expected);
        data.extend_from_slice(&[0u8; 64]);
        assert_eq!(RaffleSnapshot::decode(&data).unwrap(), expected);
    }

    #[test]
    fn decodes_program_written_account() {
        let data: Vec<u8> = fixture_lines(RAFFLE_ACCOUNT_FIXTURE).flat_map(hex_bytes).collect();
        assert_eq!(RaffleSnapshot::decode(&data).unwrap(), fixture_snapshot());
        // The local encoder must agree with the program too.
        assert_eq!(encode(&fixture_snapshot()), data);
    }

    #[test]
    fn winner_index_matches_program_draws() {
        for line in fixture_lines(WINNER_DRAWS_FIXTURE) {
            let mut parts = line.split_whitespace();
            let word: [u8; 32] = hex_bytes(parts.next().unwrap()).try_into().unwrap();
            let count: usize = parts.next().unwrap().parse().unwrap();
            let index: usize = parts.next().unwrap().parse().unwrap();
            assert_eq!(winner_index(&word, count), index, "draw {line}");
        }
    }

    #[test]
    fn decodes_pending_request() {
        let mut expected = snapshot(2);
        expected.state = RaffleState::Calculating;
        expected.pending_request_id = Some(17);
        let decoded = RaffleSnapshot::decode(&encode(&expected)).unwrap();
        assert_eq!(decoded.pending_request_id, Some(17));
        assert_eq!(decoded.players, expected.players);
    }

    #[test]
    fn rejects_foreign_and_truncated_accounts() {
        let mut data = encode(&snapshot(1));
        data[0] ^= 0xff;
        assert!(RaffleSnapshot::decode(&data).is_err());

        let data = encode(&snapshot(1));
        assert!(RaffleSnapshot::decode(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn upkeep_matches_program_predicate() {
        let raffle = snapshot(1);
        let start = raffle.last_timestamp;
        assert!(!raffle.upkeep_needed(start + 29));
        assert!(raffle.upkeep_needed(start + 30));

        let empty = snapshot(0);
        assert!(!empty.upkeep_needed(start + 60));

        let mut calculating = snapshot(1);
        calculating.state = RaffleState::Calculating;
        assert!(!calculating.upkeep_needed(start + 60));
    }

    #[test]
    fn winner_index_reads_big_endian() {
        let mut word = [0u8; 32];
        word[31] = 7;
        assert_eq!(winner_index(&word, 5), 2);
        word[0] = 1; // 2^248 + 7; 2^248 mod 5 = 1
        assert_eq!(winner_index(&word, 5), 3);
        assert_eq!(winner_index(&[0xff; 32], 1), 0);
    }

    #[test]
    fn callback_names_predicted_winner() {
        let program = Pubkey::new_unique();
        let raffle = snapshot(5);
        let randomness = [42u8; 32];

        let words = expand_randomness(&randomness, 1);
        let expected = raffle.players[winner_index(&words[0], 5)];

        let accounts = callback_accounts(&program, &raffle, &randomness).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].pubkey, raffle_pda(&program));
        assert_eq!(accounts[1].pubkey, expected);
        assert!(accounts.iter().all(|meta| meta.is_writable && !meta.is_signer));
    }

    #[test]
    fn callback_requires_players() {
        let raffle = snapshot(0);
        assert!(callback_accounts(&Pubkey::new_unique(), &raffle, &[1u8; 32]).is_err());
    }
}
