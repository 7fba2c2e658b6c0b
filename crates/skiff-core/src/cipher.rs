//! Cipher strategy for encrypted transfer streams.
//!
//! Two stream ciphers are supported:
//! - `"aes"`: AES in counter mode. A fresh random 16-byte IV is
//!   generated per stream and prepended in the clear as the first
//!   bytes of ciphertext. Versionless wire format; any change needs a
//!   new cipher identifier.
//! - `"age"`: an age (x25519) envelope. The age library manages its
//!   own framing; no IV handling is exposed at this layer.
//!
//! Identifiers map bidirectionally to stable names for wire
//! transmission. An unknown identifier is a configuration error and
//! is never silently downgraded to "no encryption".

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// AES-CTR IV width; also the fixed per-stream size overhead.
pub const AES_IV_LEN: usize = 16;

/// Supported stream cipher, identified on the wire by a lowercase
/// string and in the upload envelope by a small integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    /// AES counter mode with an IV stream prefix.
    Aes,
    /// age (x25519) envelope encryption.
    Age,
}

impl Cipher {
    /// Canonical lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::Aes => "aes",
            Cipher::Age => "age",
        }
    }

    /// Envelope id (1 = aes, 2 = age; 0 is "no encryption").
    pub fn id(&self) -> i8 {
        match self {
            Cipher::Aes => 1,
            Cipher::Age => 2,
        }
    }

    /// Map an envelope id back to a cipher. Zero means none; anything
    /// else unknown is an error, never a silent downgrade.
    pub fn from_id(id: i8) -> Result<Option<Cipher>> {
        match id {
            0 => Ok(None),
            1 => Ok(Some(Cipher::Aes)),
            2 => Ok(Some(Cipher::Age)),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }

    /// Per-cipher fixed stream overhead, used for size prediction.
    pub fn size_overhead(&self) -> u64 {
        match self {
            Cipher::Aes => AES_IV_LEN as u64,
            Cipher::Age => 0,
        }
    }
}

impl FromStr for Cipher {
    type Err = Error;

    /// Case-insensitive match on the wire name.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes" => Ok(Cipher::Aes),
            "age" => Ok(Cipher::Age),
            _ => Err(Error::UnsupportedCipher(s.to_string())),
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cipher selection plus raw key material for one transfer.
///
/// The key is never persisted by this layer; the spec lives only as
/// long as the descriptor that owns it.
#[derive(Clone)]
pub struct CipherSpec {
    pub cipher: Cipher,
    pub key: Vec<u8>,
}

impl CipherSpec {
    pub fn new(cipher: Cipher, key: Vec<u8>) -> Self {
        Self { cipher, key }
    }

    /// Validate the key material without touching any stream state.
    /// Called before any network I/O so configuration errors surface
    /// immediately.
    pub fn validate(&self) -> Result<()> {
        match self.cipher {
            Cipher::Aes => match self.key.len() {
                16 | 24 | 32 => Ok(()),
                n => Err(Error::Config {
                    message: format!("invalid AES key length {n} (expected 16, 24 or 32 bytes)"),
                }),
            },
            Cipher::Age => age_recipients(&self.key).map(|_| ()),
        }
    }
}

impl fmt::Debug for CipherSpec {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSpec")
            .field("cipher", &self.cipher)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// AES-CTR keystream over any of the three AES key sizes.
enum CtrKeystream {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl CtrKeystream {
    fn new(key: &[u8], iv: &[u8; AES_IV_LEN]) -> Result<Self> {
        let bad = |_| Error::Cipher {
            message: "AES-CTR initialization failed".into(),
        };
        match key.len() {
            16 => Ok(CtrKeystream::Aes128(
                Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(bad)?,
            )),
            24 => Ok(CtrKeystream::Aes192(
                Ctr128BE::<Aes192>::new_from_slices(key, iv).map_err(bad)?,
            )),
            32 => Ok(CtrKeystream::Aes256(
                Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(bad)?,
            )),
            n => Err(Error::Config {
                message: format!("invalid AES key length {n} (expected 16, 24 or 32 bytes)"),
            }),
        }
    }

    /// XOR the keystream over `buf` in place. Encryption and
    /// decryption are the same operation in counter mode.
    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            CtrKeystream::Aes128(c) => c.apply_keystream(buf),
            CtrKeystream::Aes192(c) => c.apply_keystream(buf),
            CtrKeystream::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// Encrypting write layer: plaintext in, ciphertext out to `inner`.
///
/// Constructing the AES variant writes the IV prefix immediately, so
/// whatever sits below (the wire digest) covers it.
pub enum EncryptLayer<W: Write> {
    Plain(W),
    Aes {
        keystream: CtrKeystream,
        scratch: Vec<u8>,
        inner: W,
    },
    Age(age::stream::StreamWriter<W>),
}

impl<W: Write> EncryptLayer<W> {
    pub fn new(mut inner: W, spec: Option<&CipherSpec>) -> Result<Self> {
        let Some(spec) = spec else {
            return Ok(EncryptLayer::Plain(inner));
        };

        match spec.cipher {
            Cipher::Aes => {
                let mut iv = [0u8; AES_IV_LEN];
                OsRng.fill_bytes(&mut iv);
                let keystream = CtrKeystream::new(&spec.key, &iv)?;

                // First bytes of the stream are the IV, in the clear.
                inner.write_all(&iv)?;

                Ok(EncryptLayer::Aes {
                    keystream,
                    scratch: Vec::new(),
                    inner,
                })
            }
            Cipher::Age => {
                let recipients = age_recipients(&spec.key)?;
                let encryptor =
                    age::Encryptor::with_recipients(recipients).ok_or(Error::Config {
                        message: "no age recipients found in key".into(),
                    })?;
                let writer = encryptor.wrap_output(inner).map_err(|e| Error::Cipher {
                    message: format!("age stream setup failed: {e}"),
                })?;
                Ok(EncryptLayer::Age(writer))
            }
        }
    }

    /// Close cipher framing and hand back the inner sink.
    pub fn finish(self) -> Result<W> {
        match self {
            EncryptLayer::Plain(w) => Ok(w),
            EncryptLayer::Aes { inner, .. } => Ok(inner),
            EncryptLayer::Age(w) => Ok(w.finish()?),
        }
    }
}

impl<W: Write> Write for EncryptLayer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            EncryptLayer::Plain(w) => w.write(buf),
            EncryptLayer::Aes {
                keystream,
                scratch,
                inner,
            } => {
                scratch.clear();
                scratch.extend_from_slice(buf);
                keystream.apply(scratch);
                inner.write_all(scratch)?;
                Ok(buf.len())
            }
            EncryptLayer::Age(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            EncryptLayer::Plain(w) => w.flush(),
            EncryptLayer::Aes { inner, .. } => inner.flush(),
            EncryptLayer::Age(w) => w.flush(),
        }
    }
}

/// Decrypting read layer: ciphertext pulled from `inner`, plaintext
/// out.
///
/// The AES variant reads and validates the 16-byte IV prefix at
/// construction time; a shorter prefix is a protocol violation. The
/// age variant parses the age header at construction.
pub enum DecryptReader<R: Read> {
    Plain(R),
    Aes { keystream: CtrKeystream, inner: R },
    Age(age::stream::StreamReader<R>),
}

impl<R: Read> std::fmt::Debug for DecryptReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecryptReader::Plain(_) => f.write_str("DecryptReader::Plain"),
            DecryptReader::Aes { .. } => f.write_str("DecryptReader::Aes"),
            DecryptReader::Age(_) => f.write_str("DecryptReader::Age"),
        }
    }
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, spec: Option<&CipherSpec>) -> Result<Self> {
        let Some(spec) = spec else {
            return Ok(DecryptReader::Plain(inner));
        };

        match spec.cipher {
            Cipher::Aes => {
                let mut iv = [0u8; AES_IV_LEN];
                read_iv(&mut inner, &mut iv)?;
                let keystream = CtrKeystream::new(&spec.key, &iv)?;
                Ok(DecryptReader::Aes { keystream, inner })
            }
            Cipher::Age => {
                let identities = age_identities(&spec.key)?;
                let decryptor = age::Decryptor::new(inner).map_err(|e| Error::Cipher {
                    message: format!("age header parse failed: {e}"),
                })?;
                let reader = match decryptor {
                    age::Decryptor::Recipients(d) => d
                        .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
                        .map_err(|e| Error::Cipher {
                            message: format!("age decryption failed: {e}"),
                        })?,
                    age::Decryptor::Passphrase(_) => {
                        return Err(Error::Protocol {
                            message: "passphrase-protected age stream is not supported".into(),
                        })
                    }
                };
                Ok(DecryptReader::Age(reader))
            }
        }
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DecryptReader::Plain(r) => r.read(buf),
            DecryptReader::Aes { keystream, inner } => {
                let n = inner.read(buf)?;
                keystream.apply(&mut buf[..n]);
                Ok(n)
            }
            DecryptReader::Age(r) => r.read(buf),
        }
    }
}

/// Read exactly the IV prefix; anything shorter means the two ends
/// are not speaking the same framing.
fn read_iv<R: Read>(reader: &mut R, iv: &mut [u8; AES_IV_LEN]) -> Result<()> {
    let mut filled = 0;
    while filled < AES_IV_LEN {
        let n = reader.read(&mut iv[filled..])?;
        if n == 0 {
            return Err(Error::Protocol {
                message: format!("truncated AES IV prefix ({filled} of {AES_IV_LEN} bytes)"),
            });
        }
        filled += n;
    }
    Ok(())
}

/// Extract age recipients from a key file.
///
/// Accepts the usual identity-file shapes: a `# public key: age1...`
/// comment, a bare `age1...` recipient line, or a secret key line
/// whose public half is derived.
fn age_recipients(key: &[u8]) -> Result<Vec<Box<dyn age::Recipient + Send>>> {
    let text = std::str::from_utf8(key).map_err(|_| Error::Config {
        message: "age key is not valid UTF-8".into(),
    })?;

    let mut recipients: Vec<Box<dyn age::Recipient + Send>> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some((_, value)) = line.split_once("public key:") {
            let r = age::x25519::Recipient::from_str(value.trim()).map_err(|e| Error::Config {
                message: format!("invalid age recipient: {e}"),
            })?;
            recipients.push(Box::new(r));
        } else if line.starts_with("age1") {
            let r = age::x25519::Recipient::from_str(line).map_err(|e| Error::Config {
                message: format!("invalid age recipient: {e}"),
            })?;
            recipients.push(Box::new(r));
        } else if line.starts_with("AGE-SECRET-KEY-") {
            let id = age::x25519::Identity::from_str(line).map_err(|e| Error::Config {
                message: format!("invalid age identity: {e}"),
            })?;
            recipients.push(Box::new(id.to_public()));
        }
    }

    if recipients.is_empty() {
        return Err(Error::Config {
            message: "no age recipients found in key".into(),
        });
    }
    Ok(recipients)
}

/// Extract age identities (secret keys) from a key file.
fn age_identities(key: &[u8]) -> Result<Vec<age::x25519::Identity>> {
    let text = std::str::from_utf8(key).map_err(|_| Error::Config {
        message: "age key is not valid UTF-8".into(),
    })?;

    let identities: Vec<age::x25519::Identity> = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("AGE-SECRET-KEY-"))
        .map(|l| {
            age::x25519::Identity::from_str(l).map_err(|e| Error::Config {
                message: format!("invalid age identity: {e}"),
            })
        })
        .collect::<Result<_>>()?;

    if identities.is_empty() {
        return Err(Error::Config {
            message: "no age identities found in key".into(),
        });
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::secrecy::ExposeSecret;
    use std::io::Cursor;

    fn encrypt(data: &[u8], spec: &CipherSpec) -> Vec<u8> {
        let mut layer = EncryptLayer::new(Vec::new(), Some(spec)).unwrap();
        layer.write_all(data).unwrap();
        layer.finish().unwrap()
    }

    fn decrypt(data: &[u8], spec: &CipherSpec) -> Vec<u8> {
        let mut reader = DecryptReader::new(Cursor::new(data.to_vec()), Some(spec)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn cipher_names_and_ids() {
        assert_eq!(Cipher::Aes.as_str(), "aes");
        assert_eq!(Cipher::Age.as_str(), "age");
        assert_eq!(Cipher::Aes.id(), 1);
        assert_eq!(Cipher::Age.id(), 2);

        assert_eq!(Cipher::from_id(0).unwrap(), None);
        assert_eq!(Cipher::from_id(1).unwrap(), Some(Cipher::Aes));
        assert_eq!(Cipher::from_id(2).unwrap(), Some(Cipher::Age));
        assert!(matches!(
            Cipher::from_id(9),
            Err(Error::UnsupportedCipher(_))
        ));
    }

    #[test]
    fn cipher_parse_is_case_insensitive() {
        assert_eq!("AES".parse::<Cipher>().unwrap(), Cipher::Aes);
        assert_eq!("Age".parse::<Cipher>().unwrap(), Cipher::Age);
        assert!(matches!(
            "rot13".parse::<Cipher>(),
            Err(Error::UnsupportedCipher(_))
        ));
    }

    #[test]
    fn aes_roundtrip_all_key_sizes() {
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();

        for key_len in [16usize, 24, 32] {
            let spec = CipherSpec::new(Cipher::Aes, vec![7u8; key_len]);
            let ciphertext = encrypt(&plaintext, &spec);

            assert_eq!(ciphertext.len(), plaintext.len() + AES_IV_LEN);
            assert_ne!(&ciphertext[AES_IV_LEN..], plaintext.as_slice());
            assert_eq!(decrypt(&ciphertext, &spec), plaintext);
        }
    }

    #[test]
    fn aes_fresh_iv_per_stream() {
        let spec = CipherSpec::new(Cipher::Aes, vec![1u8; 32]);
        let plaintext = b"same plaintext, same key";

        let a = encrypt(plaintext, &spec);
        let b = encrypt(plaintext, &spec);

        // Fresh random IV: different prefix, different ciphertext.
        assert_ne!(a[..AES_IV_LEN], b[..AES_IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn aes_rejects_bad_key_length() {
        let spec = CipherSpec::new(Cipher::Aes, vec![0u8; 15]);
        assert!(matches!(spec.validate(), Err(Error::Config { .. })));
        assert!(matches!(
            EncryptLayer::new(Vec::new(), Some(&spec)),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn aes_rejects_truncated_iv() {
        let spec = CipherSpec::new(Cipher::Aes, vec![0u8; 16]);
        let short = vec![0u8; AES_IV_LEN - 1];
        let err = DecryptReader::new(Cursor::new(short), Some(&spec)).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    fn identity_file() -> (String, String) {
        let id = age::x25519::Identity::generate();
        let secret = id.to_string().expose_secret().to_string();
        let public = id.to_public().to_string();
        (secret, public)
    }

    #[test]
    fn age_roundtrip_with_identity_file() {
        let (secret, public) = identity_file();
        let key = format!("# created: today\n# public key: {public}\n{secret}\n");
        let spec = CipherSpec::new(Cipher::Age, key.into_bytes());

        let plaintext = b"age streams manage their own framing".to_vec();
        let ciphertext = encrypt(&plaintext, &spec);

        assert_ne!(ciphertext, plaintext);
        assert_eq!(decrypt(&ciphertext, &spec), plaintext);
    }

    #[test]
    fn age_recipient_from_bare_public_line() {
        let (secret, public) = identity_file();

        // Encrypt against the bare recipient line, decrypt with the
        // secret key only.
        let enc_spec = CipherSpec::new(Cipher::Age, public.into_bytes());
        let dec_spec = CipherSpec::new(Cipher::Age, secret.into_bytes());

        let ciphertext = encrypt(b"hello", &enc_spec);
        assert_eq!(decrypt(&ciphertext, &dec_spec), b"hello");
    }

    #[test]
    fn age_rejects_empty_key() {
        let spec = CipherSpec::new(Cipher::Age, b"# nothing useful here\n".to_vec());
        assert!(matches!(spec.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn validate_accepts_good_specs() {
        CipherSpec::new(Cipher::Aes, vec![0u8; 32]).validate().unwrap();
        let (secret, _) = identity_file();
        CipherSpec::new(Cipher::Age, secret.into_bytes())
            .validate()
            .unwrap();
    }
}
