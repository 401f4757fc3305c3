//! Layered encryption over an ordered key vector.
//!
//! [encrypt] walks the key vector front to back, each application wrapping
//! the previous ciphertext. The round stores onion keys in reversed group
//! order, so the first slot (the last peer's key) touches the plaintext
//! first and the first peer's layer ends up outermost: peeling proceeds in
//! forward group order, matching the shuffle pipeline.

use crate::crypto::seal;
use bytes::Bytes;
use rand::seq::SliceRandom;
use rand_core::{CryptoRng, RngCore};

/// Applies one encryption layer per key, front to back.
pub fn encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    keys: &[seal::PublicKey],
    plaintext: &[u8],
) -> Bytes {
    let mut block = Bytes::copy_from_slice(plaintext);
    for key in keys {
        block = key.encrypt(rng, &block);
    }
    block
}

/// Peels one layer off every block.
///
/// Blocks are decrypted independently and stay in position. If any block
/// fails, the whole peel fails and the indexes of every failing block are
/// returned so the caller can escalate with evidence.
pub fn peel(key: &seal::PrivateKey, blocks: &[Bytes]) -> Result<Vec<Bytes>, Vec<usize>> {
    let mut peeled = Vec::with_capacity(blocks.len());
    let mut failed = Vec::new();
    for (index, block) in blocks.iter().enumerate() {
        match key.decrypt(block) {
            Some(clear) => peeled.push(clear),
            None => failed.push(index),
        }
    }
    if failed.is_empty() {
        Ok(peeled)
    } else {
        Err(failed)
    }
}

/// Permutes `blocks` uniformly at random.
///
/// The permutation is the anonymity-critical secret of the shuffle: it must
/// come from the CSPRNG and never be observable outside the caller.
pub fn permute<R: RngCore + CryptoRng>(rng: &mut R, blocks: &mut [Bytes]) {
    blocks.shuffle(rng);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn keys(rng: &mut ChaCha20Rng, n: usize) -> Vec<seal::PrivateKey> {
        (0..n).map(|_| seal::PrivateKey::from_rng(rng)).collect()
    }

    #[test]
    fn layers_peel_in_reverse() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let privates = keys(&mut rng, 4);
        let publics: Vec<_> = privates.iter().map(seal::PrivateKey::public_key).collect();

        let onion = encrypt(&mut rng, &publics, b"layered message");
        assert_eq!(
            onion.len(),
            b"layered message".len() + 4 * seal::LAYER_OVERHEAD
        );

        // The last key applied is the outermost layer, so peeling walks the
        // key vector back to front.
        let mut blocks = vec![onion];
        for private in privates.iter().rev() {
            blocks = peel(private, &blocks).unwrap();
        }
        assert_eq!(blocks[0].as_ref(), b"layered message");
    }

    #[test]
    fn peel_reports_every_bad_block() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let private = seal::PrivateKey::from_rng(&mut rng);
        let public = private.public_key();

        let good = public.encrypt(&mut rng, b"fine");
        let blocks = vec![
            Bytes::from_static(b"garbage that is long enough to not be short"),
            good.clone(),
            Bytes::from_static(b"more garbage that is long enough as well!!!"),
        ];
        assert_eq!(peel(&private, &blocks), Err(vec![0, 2]));
        assert!(peel(&private, &[good]).is_ok());
    }

    #[test]
    fn peel_preserves_positions() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let private = seal::PrivateKey::from_rng(&mut rng);
        let public = private.public_key();

        let blocks: Vec<_> = (0..5u8)
            .map(|i| public.encrypt(&mut rng, &[i]))
            .collect();
        let peeled = peel(&private, &blocks).unwrap();
        for (i, block) in peeled.iter().enumerate() {
            assert_eq!(block.as_ref(), [i as u8]);
        }
    }

    #[test]
    fn permute_preserves_multiset() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let original: Vec<Bytes> = (0..16u8)
            .map(|i| Bytes::copy_from_slice(&[i]))
            .collect();
        let mut shuffled = original.clone();
        permute(&mut rng, &mut shuffled);

        let mut sorted = shuffled.clone();
        sorted.sort();
        assert_eq!(sorted, original);
        // With 16 blocks an identity permutation is vanishingly unlikely.
        assert_ne!(shuffled, original);
    }
}
