//! Streaming XChaCha20 encrypt/decrypt between async readers and writers
//!
//! Data is transformed in [`CHUNK_SIZE`] pieces so a blob is never held in
//! memory as a whole.

use anyhow::{Context, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::keys::EncryptionKey;
use crate::{CHUNK_SIZE, NONCE_SIZE};

/// Encrypt everything readable from `src` into `dst`.
///
/// Writes a fresh random nonce first, then the keystream-XORed plaintext.
/// Returns the total number of bytes written to `dst` (nonce included).
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    dst.write_all(&nonce).await.context("writing nonce")?;
    let mut cipher = new_cipher(key, &nonce);

    let n = apply_stream(&mut cipher, src, dst).await?;
    Ok(NONCE_SIZE as u64 + n)
}

/// Decrypt a blob produced by [`copy_encrypt`] from `src` into `dst`.
///
/// Returns the number of plaintext bytes written to `dst`.
pub async fn copy_decrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut nonce = [0u8; NONCE_SIZE];
    src.read_exact(&mut nonce)
        .await
        .context("reading nonce: blob shorter than nonce prefix")?;
    let mut cipher = new_cipher(key, &nonce);

    apply_stream(&mut cipher, src, dst).await
}

/// Encrypt an in-memory plaintext. Convenience wrapper over [`copy_encrypt`].
pub async fn encrypt_bytes(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len());
    let mut src = plaintext;
    copy_encrypt(key, &mut src, &mut out).await?;
    Ok(out)
}

/// Decrypt an in-memory blob. Convenience wrapper over [`copy_decrypt`].
pub async fn decrypt_bytes(key: &EncryptionKey, blob: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(blob.len().saturating_sub(NONCE_SIZE));
    let mut src = blob;
    copy_decrypt(key, &mut src, &mut out).await?;
    Ok(out)
}

fn new_cipher(key: &EncryptionKey, nonce: &[u8; NONCE_SIZE]) -> XChaCha20 {
    XChaCha20::new(Key::from_slice(key.as_bytes()), XNonce::from_slice(nonce))
}

async fn apply_stream<R, W>(cipher: &mut XChaCha20, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = src.read(&mut buf).await.context("reading stream input")?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])
            .await
            .context("writing stream output")?;
        written += n as u64;
    }

    dst.flush().await.context("flushing stream output")?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let payload = b"random data";

        let mut blob = Vec::new();
        let n = copy_encrypt(&key, &mut &payload[..], &mut blob).await.unwrap();
        assert_eq!(n as usize, NONCE_SIZE + payload.len());
        assert_eq!(blob.len(), NONCE_SIZE + payload.len());

        let mut out = Vec::new();
        let n = copy_decrypt(&key, &mut blob.as_slice(), &mut out).await.unwrap();
        assert_eq!(n as usize, payload.len());
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_empty() {
        let key = generate_key();
        let blob = encrypt_bytes(&key, b"").await.unwrap();
        assert_eq!(blob.len(), NONCE_SIZE);
        assert_eq!(decrypt_bytes(&key, &blob).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_spans_multiple_chunks() {
        let key = generate_key();
        let payload: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();

        let blob = encrypt_bytes(&key, &payload).await.unwrap();
        assert_eq!(decrypt_bytes(&key, &blob).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let key = generate_key();
        let payload = vec![0u8; 256];
        let blob = encrypt_bytes(&key, &payload).await.unwrap();
        assert_ne!(&blob[NONCE_SIZE..], payload.as_slice());
    }

    #[tokio::test]
    async fn test_fresh_nonce_per_blob() {
        let key = generate_key();
        let a = encrypt_bytes(&key, b"same input").await.unwrap();
        let b = encrypt_bytes(&key, b"same input").await.unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage_not_error() {
        let k1 = generate_key();
        let k2 = generate_key();
        let blob = encrypt_bytes(&k1, b"secret data").await.unwrap();

        let out = decrypt_bytes(&k2, &blob).await.unwrap();
        assert_eq!(out.len(), b"secret data".len());
        assert_ne!(out, b"secret data");
    }

    #[tokio::test]
    async fn test_tampering_goes_undetected() {
        let key = generate_key();
        let mut blob = encrypt_bytes(&key, b"secret data").await.unwrap();
        blob[NONCE_SIZE] ^= 0xFF;

        let out = decrypt_bytes(&key, &blob).await.unwrap();
        assert_eq!(out[0], b's' ^ 0xFF);
        assert_eq!(&out[1..], b"ecret data");
    }

    #[tokio::test]
    async fn test_truncated_blob_fails() {
        let key = generate_key();
        let err = decrypt_bytes(&key, &[0u8; NONCE_SIZE - 1]).await.unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    proptest! {
        #[test]
        fn roundtrip_any_bytes(data in proptest::collection::vec(any::<u8>(), 0..=70_000)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let key = generate_key();
            let out = rt.block_on(async {
                let blob = encrypt_bytes(&key, &data).await.unwrap();
                decrypt_bytes(&key, &blob).await.unwrap()
            });
            prop_assert_eq!(out, data);
        }
    }
}
