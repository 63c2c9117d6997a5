//! Per-fragment byte pipeline: AES-128-CBC decryption with deferred PKCS#7
//! unpadding, the decryption-key cache, and typefind buffering.
//!
//! Bytes stream in from the downloader in arbitrary chunk sizes. When a
//! cipher is bound, input accumulates until a multiple of the 16-byte block
//! size is available, is decrypted in place, and flows out — except for the
//! final decrypted block of the fragment, which is retained so that its
//! PKCS#7 padding can be stripped once the fragment is complete. Cancelling
//! mid-fragment simply resets the pipeline; the cipher chain is
//! re-initialised on the next fragment.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use url::Url;

use crate::events::MediaCaps;
use crate::fetch::{fetch_bytes, DownloadRequest, UriDownloader};
use crate::StreamError;

const AES_BLOCK: usize = 16;

/// The injected block cipher. One call decrypts a whole number of AES
/// blocks; chaining across calls is the caller's business (the last
/// ciphertext block of a chunk is the IV of the next).
pub trait SegmentCipher: Send + Sync {
    /// Decrypt `data` in place with AES-128-CBC. The caller guarantees
    /// `data.len() % 16 == 0`.
    fn decrypt_cbc(
        &self,
        key: &[u8; 16],
        iv: &[u8; 16],
        data: &mut [u8],
    ) -> Result<(), StreamError>;
}

/// AES-128-CBC via the RustCrypto `aes` + `cbc` crates.
pub struct Aes128CbcCipher;

impl SegmentCipher for Aes128CbcCipher {
    fn decrypt_cbc(
        &self,
        key: &[u8; 16],
        iv: &[u8; 16],
        data: &mut [u8],
    ) -> Result<(), StreamError> {
        use aes::cipher::{BlockDecryptMut, KeyIvInit};

        debug_assert_eq!(data.len() % AES_BLOCK, 0);
        let mut decryptor = cbc::Decryptor::<aes::Aes128>::new(key.into(), iv.into());
        for chunk in data.chunks_exact_mut(AES_BLOCK) {
            decryptor.decrypt_block_mut(aes::Block::from_mut_slice(chunk));
        }
        Ok(())
    }
}

/// Decryption state for one fragment in flight.
pub struct FragmentPipeline {
    cipher: Arc<dyn SegmentCipher>,
    key: Option<[u8; 16]>,
    next_iv: [u8; 16],
    /// Ciphertext buffered until a whole number of blocks is available.
    pending_encrypted: BytesMut,
    /// The last decrypted block, withheld until end-of-fragment so its
    /// padding can be stripped.
    pending_last_block: Option<[u8; AES_BLOCK]>,
    /// Bytes forwarded downstream so far for this fragment.
    current_offset: u64,
}

impl FragmentPipeline {
    pub fn new(cipher: Arc<dyn SegmentCipher>) -> FragmentPipeline {
        FragmentPipeline {
            cipher,
            key: None,
            next_iv: [0; AES_BLOCK],
            pending_encrypted: BytesMut::new(),
            pending_last_block: None,
            current_offset: 0,
        }
    }

    /// Begin a fragment. `cipher_params` carries the key and IV when the
    /// fragment is encrypted.
    pub fn start_fragment(&mut self, cipher_params: Option<([u8; 16], [u8; 16])>) {
        self.pending_encrypted.clear();
        self.pending_last_block = None;
        self.current_offset = 0;
        match cipher_params {
            Some((key, iv)) => {
                self.key = Some(key);
                self.next_iv = iv;
            }
            None => self.key = None,
        }
    }

    /// Offset of the next byte that will be forwarded downstream.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Feed fragment bytes; returns the plaintext ready to forward.
    pub fn push(&mut self, data: &[u8]) -> Result<Bytes, StreamError> {
        let Some(key) = self.key else {
            self.current_offset += data.len() as u64;
            return Ok(Bytes::copy_from_slice(data));
        };
        self.pending_encrypted.extend_from_slice(data);
        let aligned = self.pending_encrypted.len() - self.pending_encrypted.len() % AES_BLOCK;
        if aligned == 0 {
            return Ok(Bytes::new());
        }
        let mut block_data = self.pending_encrypted.split_to(aligned);
        // The final ciphertext block chains into the next call.
        let iv = self.next_iv;
        self.next_iv.copy_from_slice(&block_data[aligned - AES_BLOCK..]);
        self.cipher.decrypt_cbc(&key, &iv, &mut block_data)?;

        // Prepend the block retained from the previous call, withhold the
        // new final block.
        let mut out = BytesMut::new();
        if let Some(prev) = self.pending_last_block.take() {
            out.extend_from_slice(&prev);
        }
        let mut last = [0u8; AES_BLOCK];
        last.copy_from_slice(&block_data[aligned - AES_BLOCK..]);
        self.pending_last_block = Some(last);
        out.extend_from_slice(&block_data[..aligned - AES_BLOCK]);
        trace!(
            plaintext = out.len(),
            withheld = AES_BLOCK,
            "decrypted fragment chunk"
        );
        self.current_offset += out.len() as u64;
        Ok(out.freeze())
    }

    /// End of fragment: strip the PKCS#7 padding from the retained final
    /// block and return what remains of it.
    pub fn finish(&mut self) -> Result<Bytes, StreamError> {
        if self.key.is_none() {
            return Ok(Bytes::new());
        }
        if !self.pending_encrypted.is_empty() {
            return Err(StreamError::StreamDecrypt(format!(
                "fragment length not a multiple of the cipher block size \
                 ({} trailing bytes)",
                self.pending_encrypted.len()
            )));
        }
        let Some(last) = self.pending_last_block.take() else {
            return Err(StreamError::StreamDecrypt(String::from(
                "encrypted fragment contained no complete block",
            )));
        };
        let padding = last[AES_BLOCK - 1] as usize;
        if padding == 0 || padding > AES_BLOCK {
            return Err(StreamError::StreamDecrypt(format!(
                "invalid PKCS#7 padding value {padding}"
            )));
        }
        let keep = AES_BLOCK - padding;
        self.current_offset += keep as u64;
        Ok(Bytes::copy_from_slice(&last[..keep]))
    }

    /// Abandon the in-flight fragment (flush-seek). The cipher context is
    /// re-initialised by the next [`Self::start_fragment`].
    pub fn reset(&mut self) {
        self.key = None;
        self.pending_encrypted.clear();
        self.pending_last_block = None;
        self.current_offset = 0;
    }
}

/// The injected typefinder.
pub trait TypeFind: Send + Sync {
    /// Inspect the leading bytes of a stream and return the detected caps
    /// with a confidence in `[0, 1]`, or None when undecided.
    fn probe(&self, data: &[u8]) -> Option<(MediaCaps, f32)>;
}

/// Typefinding does not run on fewer bytes than this.
const TYPEFIND_MIN_BYTES: usize = 2 * 1024;
/// Give up once this much data accumulated without a detection.
const TYPEFIND_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Outcome of feeding bytes to the typefind buffer.
pub enum TypefindProgress {
    /// Caps already known or just detected; the payload (including any
    /// buffered prefix) should flow downstream.
    Ready(MediaCaps, Bytes),
    /// Still buffering.
    NeedMore,
}

/// Buffers the head of a representation's first fragment until the injected
/// typefinder recognises it. Runs once per representation switch.
pub struct TypefindState {
    finder: Arc<dyn TypeFind>,
    buffer: BytesMut,
    caps: Option<MediaCaps>,
}

impl TypefindState {
    pub fn new(finder: Arc<dyn TypeFind>) -> TypefindState {
        TypefindState { finder, buffer: BytesMut::new(), caps: None }
    }

    pub fn caps(&self) -> Option<&MediaCaps> {
        self.caps.as_ref()
    }

    /// Force a new detection, after a representation switch.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.caps = None;
    }

    pub fn push(&mut self, data: Bytes) -> Result<TypefindProgress, StreamError> {
        if let Some(caps) = &self.caps {
            return Ok(TypefindProgress::Ready(caps.clone(), data));
        }
        self.buffer.extend_from_slice(&data);
        if self.buffer.len() < TYPEFIND_MIN_BYTES {
            return Ok(TypefindProgress::NeedMore);
        }
        if let Some((caps, probability)) = self.finder.probe(&self.buffer) {
            debug!(caps = %caps, probability, "typefind succeeded");
            self.caps = Some(caps.clone());
            return Ok(TypefindProgress::Ready(caps, self.buffer.split().freeze()));
        }
        if self.buffer.len() >= TYPEFIND_MAX_BYTES {
            return Err(StreamError::TypefindFailed);
        }
        Ok(TypefindProgress::NeedMore)
    }

    /// End of fragment reached while still undetected: run the finder on
    /// whatever we have, below the usual minimum.
    pub fn finish(&mut self) -> Result<TypefindProgress, StreamError> {
        if let Some(caps) = &self.caps {
            return Ok(TypefindProgress::Ready(caps.clone(), Bytes::new()));
        }
        if let Some((caps, _)) = self.finder.probe(&self.buffer) {
            self.caps = Some(caps.clone());
            return Ok(TypefindProgress::Ready(caps, self.buffer.split().freeze()));
        }
        Err(StreamError::TypefindFailed)
    }
}

/// URL-keyed cache of 16-byte AES keys, shared by all tracks of a session.
/// Entries are tiny; the cache is bounded all the same so a hostile playlist
/// cannot grow it without limit.
pub struct KeyCache {
    entries: Mutex<KeyCacheInner>,
    limit: usize,
}

struct KeyCacheInner {
    map: HashMap<Url, [u8; 16]>,
    order: VecDeque<Url>,
}

impl KeyCache {
    pub fn new(limit: usize) -> KeyCache {
        KeyCache {
            entries: Mutex::new(KeyCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            limit: limit.max(1),
        }
    }

    /// Look up a key, downloading it on a miss. A failed download is retried
    /// once with the downloader's refresh flag set before giving up with
    /// `KeyFetchFailed`.
    pub async fn get(
        &self,
        downloader: &dyn UriDownloader,
        uri: &Url,
        referer: Option<&Url>,
        allow_cache: bool,
    ) -> Result<[u8; 16], StreamError> {
        if let Some(key) = self.entries.lock().unwrap().map.get(uri) {
            trace!(%uri, "key cache hit");
            return Ok(*key);
        }
        let mut request = DownloadRequest::new(uri.clone())
            .with_referer(referer.cloned())
            .with_allow_cache(allow_cache);
        let body = match fetch_bytes(downloader, request.clone()).await {
            Ok((_, body)) => body,
            Err(e) => {
                warn!(%uri, error = %e, "key download failed, retrying with refresh");
                request = request.with_refresh(true);
                fetch_bytes(downloader, request)
                    .await
                    .map_err(|e| StreamError::KeyFetchFailed(format!("{uri}: {e}")))?
                    .1
            }
        };
        if body.len() < 16 {
            return Err(StreamError::InvalidKey(format!(
                "{uri}: key is {} bytes, expected 16",
                body.len()
            )));
        }
        if body.len() > 16 {
            warn!(%uri, len = body.len(), "key longer than 16 bytes, truncating");
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&body[..16]);
        let mut inner = self.entries.lock().unwrap();
        if inner.map.len() >= self.limit {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
        inner.map.insert(uri.clone(), key);
        inner.order.push_back(uri.clone());
        Ok(key)
    }
}
