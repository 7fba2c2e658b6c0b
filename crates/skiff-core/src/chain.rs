//! Transform chain composition for the transfer pipeline.
//!
//! The pipeline ordering is a wire contract, fixed on both sides:
//!
//! - Upload: `source -> [gzip] -> [encrypt] -> digest -> sink`. The
//!   digest covers exactly the bytes handed to the sink (IV prefix
//!   included), because that is what the remote end can recompute
//!   without a key.
//! - Download mirror: `body -> digest -> [decrypt] -> [gunzip] ->
//!   sink`. The body is hashed before any local transform, at the
//!   same altitude the server hashed it.
//!
//! Encryption always runs over the compressed output when compression
//! is requested; the two stages are not interchangeable.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::checksum::{DigestReader, DigestWriter, SharedDigest};
use crate::cipher::{CipherSpec, DecryptReader, EncryptLayer};
use crate::error::Result;

enum WriteStage<W: Write> {
    Raw(EncryptLayer<DigestWriter<W>>),
    Gzip(GzEncoder<EncryptLayer<DigestWriter<W>>>),
}

/// Upload-side write path: plaintext in, wire bytes out to the sink.
pub struct UploadChain<W: Write> {
    stage: WriteStage<W>,
}

impl<W: Write> UploadChain<W> {
    pub fn new(sink: W, cipher: Option<&CipherSpec>, compress: bool) -> Result<Self> {
        tracing::trace!(
            cipher = cipher.map(|s| s.cipher.as_str()),
            compress,
            "building upload chain"
        );
        let digest = DigestWriter::new(sink);
        let encrypt = EncryptLayer::new(digest, cipher)?;
        let stage = if compress {
            WriteStage::Gzip(GzEncoder::new(encrypt, Compression::default()))
        } else {
            WriteStage::Raw(encrypt)
        };
        Ok(Self { stage })
    }

    /// Close every layer in order (gzip trailer, cipher framing) and
    /// return the sink together with the hex digest of the wire bytes.
    pub fn finish(self) -> Result<(W, String)> {
        let encrypt = match self.stage {
            WriteStage::Raw(e) => e,
            WriteStage::Gzip(gz) => gz.finish()?,
        };
        let (mut sink, digest) = encrypt.finish()?.into_parts();
        sink.flush()?;
        Ok((sink, digest.finish_hex()))
    }
}

impl<W: Write> Write for UploadChain<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.stage {
            WriteStage::Raw(e) => e.write(buf),
            WriteStage::Gzip(gz) => gz.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.stage {
            WriteStage::Raw(e) => e.flush(),
            WriteStage::Gzip(gz) => gz.flush(),
        }
    }
}

enum ReadStage<R: Read> {
    Raw(DecryptReader<DigestReader<R>>),
    Gzip(GzDecoder<DecryptReader<DigestReader<R>>>),
}

/// Download-side read path: wire bytes in, plaintext out.
///
/// The digest handle reports the hash of the raw body bytes, not the
/// decrypted or decompressed output.
pub struct DownloadChain<R: Read> {
    stage: ReadStage<R>,
    digest: SharedDigest,
}

impl<R: Read> DownloadChain<R> {
    pub fn new(body: R, cipher: Option<&CipherSpec>, extract: bool) -> Result<Self> {
        tracing::trace!(
            cipher = cipher.map(|s| s.cipher.as_str()),
            extract,
            "building download chain"
        );
        let reader = DigestReader::new(body);
        let digest = reader.digest();
        let decrypt = DecryptReader::new(reader, cipher)?;
        let stage = if extract {
            ReadStage::Gzip(GzDecoder::new(decrypt))
        } else {
            ReadStage::Raw(decrypt)
        };
        Ok(Self { stage, digest })
    }

    /// Hex digest of the raw bytes consumed so far.
    pub fn digest_hex(&self) -> String {
        self.digest.finish_hex()
    }
}

impl<R: Read> Read for DownloadChain<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.stage {
            ReadStage::Raw(r) => r.read(buf),
            ReadStage::Gzip(gz) => gz.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::digest_hex;
    use crate::cipher::{Cipher, AES_IV_LEN};
    use std::io::Cursor;

    fn aes_spec() -> CipherSpec {
        CipherSpec::new(Cipher::Aes, vec![9u8; 32])
    }

    fn push_through(
        data: &[u8],
        cipher: Option<&CipherSpec>,
        compress: bool,
    ) -> (Vec<u8>, String) {
        let mut chain = UploadChain::new(Vec::new(), cipher, compress).unwrap();
        chain.write_all(data).unwrap();
        chain.finish().unwrap()
    }

    fn pull_through(
        wire: &[u8],
        cipher: Option<&CipherSpec>,
        extract: bool,
    ) -> (Vec<u8>, String) {
        let mut chain = DownloadChain::new(Cursor::new(wire.to_vec()), cipher, extract).unwrap();
        let mut out = Vec::new();
        chain.read_to_end(&mut out).unwrap();
        let digest = chain.digest_hex();
        (out, digest)
    }

    #[test]
    fn digest_covers_wire_bytes_plain() {
        let (wire, digest) = push_through(b"plain payload", None, false);
        assert_eq!(wire, b"plain payload");
        assert_eq!(digest, digest_hex(&wire));
    }

    #[test]
    fn digest_covers_wire_bytes_encrypted() {
        let spec = aes_spec();
        let (wire, digest) = push_through(b"secret payload", Some(&spec), false);

        // IV prefix is part of the wire and part of the digest.
        assert_eq!(wire.len(), b"secret payload".len() + AES_IV_LEN);
        assert_eq!(digest, digest_hex(&wire));
    }

    #[test]
    fn digest_covers_wire_bytes_compressed_and_encrypted() {
        let spec = aes_spec();
        let data = b"compressible compressible compressible".repeat(100);
        let (wire, digest) = push_through(&data, Some(&spec), true);

        assert!(wire.len() < data.len());
        assert_eq!(digest, digest_hex(&wire));
    }

    #[test]
    fn roundtrip_plain() {
        let (wire, up_digest) = push_through(b"hello", None, false);
        let (out, down_digest) = pull_through(&wire, None, false);

        assert_eq!(out, b"hello");
        assert_eq!(up_digest, down_digest);
    }

    #[test]
    fn roundtrip_compressed() {
        let data = b"gzip me gzip me gzip me ".repeat(50);
        let (wire, up_digest) = push_through(&data, None, true);
        let (out, down_digest) = pull_through(&wire, None, true);

        assert_eq!(out, data);
        assert_eq!(up_digest, down_digest);
    }

    #[test]
    fn roundtrip_encrypted_and_compressed() {
        let spec = aes_spec();
        let data = b"both transforms at once ".repeat(80);
        let (wire, up_digest) = push_through(&data, Some(&spec), true);
        let (out, down_digest) = pull_through(&wire, Some(&spec), true);

        assert_eq!(out, data);
        // Both ends hashed the same wire bytes.
        assert_eq!(up_digest, down_digest);
        assert_eq!(up_digest, digest_hex(&wire));
    }

    #[test]
    fn download_digest_is_pre_transform() {
        let spec = aes_spec();
        let (wire, _) = push_through(b"altitude check", Some(&spec), false);
        let (out, down_digest) = pull_through(&wire, Some(&spec), false);

        // The digest is of the ciphertext wire, not the plaintext.
        assert_eq!(out, b"altitude check");
        assert_eq!(down_digest, digest_hex(&wire));
        assert_ne!(down_digest, digest_hex(b"altitude check"));
    }

    #[test]
    fn roundtrip_age() {
        use age::secrecy::ExposeSecret;
        let id = age::x25519::Identity::generate();
        let key = id.to_string().expose_secret().to_string().into_bytes();
        let spec = CipherSpec::new(Cipher::Age, key);

        let data = b"age envelope through the chain".repeat(20);
        let (wire, up_digest) = push_through(&data, Some(&spec), true);
        let (out, down_digest) = pull_through(&wire, Some(&spec), true);

        assert_eq!(out, data);
        assert_eq!(up_digest, down_digest);
    }
}
