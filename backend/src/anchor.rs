//! Anchor wire-format helpers: discriminators and a little-endian reader for
//! Borsh-encoded account and event bodies.

use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("{namespace}:{name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// `sha256("account:<Name>")[..8]`
pub fn account_discriminator(name: &str) -> [u8; 8] {
    discriminator("account", name)
}

/// `sha256("event:<Name>")[..8]`
pub fn event_discriminator(name: &str) -> [u8; 8] {
    discriminator("event", name)
}

/// `sha256("global:<name>")[..8]`
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    discriminator("global", name)
}

/// Sequential Borsh reader. Every getter returns `None` once the input runs
/// short.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }

    pub fn pubkey(&mut self) -> Option<Pubkey> {
        self.array::<32>().map(Pubkey::new_from_array)
    }

    pub fn option_u64(&mut self) -> Option<Option<u64>> {
        match self.u8()? {
            0 => Some(None),
            1 => Some(Some(self.u64()?)),
            _ => None,
        }
    }

    /// Borsh `Vec<Pubkey>`: u32 length prefix, then the keys.
    pub fn pubkey_vec(&mut self) -> Option<Vec<Pubkey>> {
        let len = self.u32()? as usize;
        // Reject lengths the remaining bytes cannot hold before allocating.
        if len.checked_mul(32)? > self.data.len().saturating_sub(self.pos) {
            return None;
        }
        (0..len).map(|_| self.pubkey()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminators_differ_by_namespace() {
        assert_ne!(
            account_discriminator("RandomnessRequest"),
            event_discriminator("RandomnessRequest")
        );
        assert_eq!(
            instruction_discriminator("perform_upkeep"),
            instruction_discriminator("perform_upkeep")
        );
    }

    #[test]
    fn reader_decodes_in_order() {
        let key = Pubkey::new_unique();
        let mut data = vec![7u8];
        data.extend_from_slice(&513u16.to_le_bytes());
        data.extend_from_slice(&(-5i64).to_le_bytes());
        data.push(1);
        data.extend_from_slice(&42u64.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(key.as_ref());

        let mut reader = Reader::new(&data);
        assert_eq!(reader.u8(), Some(7));
        assert_eq!(reader.u16(), Some(513));
        assert_eq!(reader.i64(), Some(-5));
        assert_eq!(reader.option_u64(), Some(Some(42)));
        assert_eq!(reader.pubkey_vec(), Some(vec![key]));
        assert_eq!(reader.u8(), None);
    }

    #[test]
    fn reader_rejects_bad_option_tag_and_oversized_vec() {
        assert_eq!(Reader::new(&[2u8]).option_u64(), None);
        assert_eq!(Reader::new(&[0u8]).option_u64(), Some(None));

        let mut data = 1_000u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 64]);
        assert_eq!(Reader::new(&data).pubkey_vec(), None);
    }
}
