//! Block envelopes: routing prefix, signed header, body and signature.
//!
//! ```text
//! 01 64 | version | size u16 | ttl | prio | crypto | sender | receivers
//! sid u32 | return index u16 | inc u16 | type | flags | timestamp u64 | [iv]
//! body | [signature]
//! ```
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;

use smol_str::SmolStr;

use crate::binary::{IV_SIZE, ProtocolDataType, RECEIVER_KEY_SIZE, SIGNATURE_SIZE};
use crate::buffer::Buffer;
use crate::config::{CompileOptions, Config, Receiver};
use crate::error::{Error, FrameError, InnerError};
use crate::sid::ScopeIdRegistry;
use crate::value::{Target, TargetKind};

const MAGIC: [u8; 2] = [0x01, 0x64];
const VERSION: u8 = 1;
/// Offset of the total-size field in the routing prefix.
const SIZE_OFFSET: usize = 3;
const TTL_OFFSET: usize = 5;
const SENDER_OFFSET: usize = 8;
/// Timestamps are milliseconds since 2022-01-21T23:00:00Z.
const TIMESTAMP_EPOCH_MS: i64 = 1_642_806_000_000;
const SIGNED_HEADER_SIZE: usize = 18;
const DEVICE_TYPE_MOBILE: u8 = 1;
const FLOOD_MARKER: u16 = 0xffff;

/// Signing and symmetric encryption used while framing.
pub trait CryptoProvider: Send + Sync {
    /// Signs `data`; the result is truncated or zero-padded to 96 bytes.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, FrameError>;

    fn encrypt(&self, data: &[u8], key: &[u8], iv: &[u8; IV_SIZE]) -> Result<Vec<u8>, FrameError>;

    /// Length of the ciphertext for `plain` bytes of input. Must not
    /// decrease as `plain` grows.
    fn encrypted_len(&self, plain: usize) -> usize {
        plain
    }

    fn generate_iv(&self) -> Result<[u8; IV_SIZE], FrameError> {
        let mut iv = [0u8; IV_SIZE];
        getrandom::getrandom(&mut iv).map_err(|e| FrameError::RandomSource(e.to_string()))?;
        Ok(iv)
    }
}

/// Header state shared by every block of one compile call.
#[derive(Clone)]
pub(crate) struct FrameContext {
    registry: Arc<ScopeIdRegistry>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    options: CompileOptions,
    sid: u32,
    generated_sid: bool,
    return_index: u16,
    ttl: u8,
    priority: u8,
    remote: String,
}

impl std::fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameContext")
            .field("sid", &self.sid)
            .field("return_index", &self.return_index)
            .field("data_type", &self.options.data_type)
            .finish()
    }
}

impl FrameContext {
    /// Validates the options and reserves the scope id and return index.
    pub(crate) fn new(
        registry: Arc<ScopeIdRegistry>,
        crypto: Option<Arc<dyn CryptoProvider>>,
        options: &CompileOptions,
        config: &Config,
    ) -> Result<Self, FrameError> {
        if options.encrypt && options.symmetric_key.is_none() {
            return Err(FrameError::MissingEncryptionKey);
        }
        if (options.encrypt || options.sign) && crypto.is_none() {
            return Err(FrameError::NoCryptoProvider(if options.sign { "signing" } else { "encryption" }));
        }

        let (sid, generated_sid) = match (options.sid, options.data_type) {
            (Some(sid), _) => (sid, false),
            (None, ProtocolDataType::Response) => return Err(FrameError::ResponseWithoutSid),
            (None, ProtocolDataType::Data) => (0, false),
            (None, _) => (registry.generate(false)?, true),
        };
        let return_index = match options.block_index {
            Some(index) => index,
            None => registry.next_return_index(sid),
        };
        let remote = options
            .receivers
            .first()
            .map(|r| r.target.to_string())
            .unwrap_or_default();

        Ok(Self {
            ttl: options.ttl.unwrap_or(config.ttl),
            priority: options.priority.unwrap_or(config.priority),
            registry,
            crypto,
            options: options.clone(),
            sid,
            generated_sid,
            return_index,
            remote,
        })
    }

    pub(crate) fn sid(&self) -> u32 {
        self.sid
    }

    fn crypto_flag(&self) -> u8 {
        match (self.options.sign, self.options.encrypt) {
            (true, false) => 1,
            (true, true) => 2,
            (false, true) => 3,
            (false, false) => 0,
        }
    }

    /// Size of everything but the body.
    fn overhead(&self) -> Result<usize, InnerError> {
        let mut prefix = Buffer::new();
        self.write_routing_prefix(&mut prefix)?;
        let iv = if self.options.encrypt { IV_SIZE } else { 0 };
        let signature = if self.options.sign { SIGNATURE_SIZE } else { 0 };
        Ok(prefix.pos() + SIGNED_HEADER_SIZE + iv + signature)
    }

    fn body_len(&self, plain: usize) -> usize {
        match &self.crypto {
            Some(crypto) if self.options.encrypt => crypto.encrypted_len(plain),
            _ => plain,
        }
    }

    /// Size of the block framed around a body of `plain` bytes.
    pub(crate) fn framed_len(&self, plain: usize) -> Result<usize, InnerError> {
        Ok(self.overhead()? + self.body_len(plain))
    }

    /// Largest body that frames into at most `max` bytes, but never 0.
    pub(crate) fn chunk_size(&self, max: usize) -> Result<usize, InnerError> {
        let budget = max.saturating_sub(self.overhead()?);
        let (mut low, mut high) = (0, budget);
        while low < high {
            let mid = low + (high - low).div_ceil(2);
            if self.body_len(mid) <= budget {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        Ok(low.max(1))
    }

    fn write_routing_prefix(&self, out: &mut Buffer) -> Result<(), InnerError> {
        out.write_bytes(&MAGIC);
        out.write_u8(VERSION);
        out.write_u16(0);
        out.write_u8(self.ttl);
        out.write_u8(self.priority);
        out.write_u8(self.crypto_flag());

        match &self.options.sender {
            Some(sender) => out.write_target(sender)?,
            None => out.write_u8(0),
        }

        if self.options.flood {
            out.write_u16(FLOOD_MARKER);
        } else if self.options.receivers.is_empty() {
            out.write_u16(0);
        } else {
            let receivers = receiver_list(&self.options.receivers)?;
            let len = u16::try_from(receivers.len())
                .map_err(|_| FrameError::TargetNameTooLong("receiver list".to_string()))?;
            out.write_u16(len);
            out.write_bytes(&receivers);
        }
        Ok(())
    }

    fn next_inc(&self) -> u16 {
        match (self.options.block_increment, self.options.data_type) {
            (Some(inc), _) => inc,
            (None, ProtocolDataType::Response) => self.registry.next_remote_block_inc(self.sid, &self.remote),
            (None, _) => self.registry.next_block_inc(self.sid),
        }
    }

    /// Wraps `body` in a complete envelope.
    pub(crate) fn frame(&self, body: &[u8], end_of_scope: bool) -> Result<Vec<u8>, InnerError> {
        let mut block = Buffer::new();
        self.write_routing_prefix(&mut block)?;
        let signed_start = block.pos();

        let inc = self.next_inc();
        let encrypted = self.options.encrypt;
        let flags = (u8::from(encrypted) << 7)
            | (u8::from(self.options.executable()) << 6)
            | (u8::from(end_of_scope) << 5)
            | DEVICE_TYPE_MOBILE;

        block.write_u32(self.sid);
        block.write_u16(self.return_index);
        block.write_u16(inc);
        block.write_u8(self.options.data_type as u8);
        block.write_u8(flags);
        block.write_i64(Utc::now().timestamp_millis() - TIMESTAMP_EPOCH_MS);

        match (&self.crypto, &self.options.symmetric_key) {
            (Some(crypto), Some(key)) if encrypted => {
                let iv = crypto.generate_iv()?;
                block.write_bytes(&iv);
                block.write_bytes(&crypto.encrypt(body, key, &iv)?);
            }
            _ => block.write_bytes(body),
        }

        if self.options.sign {
            let crypto = self.crypto.as_ref().ok_or(FrameError::NoCryptoProvider("signing"))?;
            let mut signature = crypto.sign(&block.as_slice()[signed_start..])?;
            signature.resize(SIGNATURE_SIZE, 0);
            block.write_bytes(&signature);
        }

        let total = block.pos();
        let size = u16::try_from(total).unwrap_or(0);
        let mut bytes = block.into_vec();
        bytes[SIZE_OFFSET..SIZE_OFFSET + 2].copy_from_slice(&size.to_le_bytes());

        tracing::trace!(sid = self.sid, inc, total, end_of_scope, "framed block");

        if end_of_scope {
            if self.options.data_type == ProtocolDataType::Response {
                self.registry.reset_remote(self.sid, &self.remote);
            }
            if self.generated_sid {
                self.registry.release(self.sid);
            }
        }
        Ok(bytes)
    }
}

/// `0 count16 (type name_len 0 instance_len name instance has_key [key])*`
fn receiver_list(receivers: &[Receiver]) -> Result<Vec<u8>, FrameError> {
    let mut list = Buffer::new();
    list.write_u8(0);
    list.write_u16(receivers.len() as u16);
    for receiver in receivers {
        let target = &receiver.target;
        let too_long = || FrameError::TargetNameTooLong(target.to_string());
        let instance = target.instance.as_deref().unwrap_or("");
        let name_len = u8::try_from(target.name.len()).map_err(|_| too_long())?;
        let instance_len = u8::try_from(instance.len()).map_err(|_| too_long())?;

        list.write_code(target.kind.code());
        list.write_u8(name_len);
        list.write_u8(0);
        list.write_u8(instance_len);
        list.write_bytes(&target.name);
        list.write_bytes(instance.as_bytes());
        match &receiver.key {
            Some(key) if key.len() == RECEIVER_KEY_SIZE => {
                list.write_u8(1);
                list.write_bytes(key);
            }
            Some(_) => return Err(FrameError::InvalidReceiverKey(target.to_string())),
            None => list.write_u8(0),
        }
    }
    Ok(list.into_vec())
}

/// Inverse of [`receiver_list`].
fn read_receiver_list(list: &[u8]) -> Option<Vec<Receiver>> {
    if list.is_empty() {
        return Some(Vec::new());
    }
    if list[0] != 0 {
        return None;
    }
    let count = u16::from_le_bytes([*list.get(1)?, *list.get(2)?]);
    let mut receivers = Vec::with_capacity(count as usize);
    let mut i = 3;
    for _ in 0..count {
        let kind = target_kind(*list.get(i)?)?;
        let name_len = *list.get(i + 1)? as usize;
        let instance_len = *list.get(i + 3)? as usize;
        i += 4;
        let name = list.get(i..i + name_len)?.to_vec();
        i += name_len;
        let instance = std::str::from_utf8(list.get(i..i + instance_len)?).ok()?;
        i += instance_len;
        let key = match *list.get(i)? {
            0 => None,
            _ => {
                let key = list.get(i + 1..i + 1 + RECEIVER_KEY_SIZE)?.to_vec();
                i += RECEIVER_KEY_SIZE;
                Some(key)
            }
        };
        i += 1;

        let target = Target { kind, name, instance: None };
        let target = if instance.is_empty() { target } else { target.with_instance(instance) };
        receivers.push(Receiver { target, key });
    }
    Some(receivers)
}

/// Kind of a target opcode, wildcard codes included.
fn target_kind(code: u8) -> Option<TargetKind> {
    [TargetKind::Person, TargetKind::Institution, TargetKind::Endpoint]
        .into_iter()
        .find(|kind| matches!(code.checked_sub(kind.code().byte()), Some(0 | 1)))
}

/// Reads the sender at `at`; returns it with the offset right after it.
fn read_sender(block: &[u8], at: usize) -> Option<(Option<Target>, usize)> {
    let code = *block.get(at)?;
    if code == 0 {
        return Some((None, at + 1));
    }
    let kind = target_kind(code)?;
    let name_len = *block.get(at + 1)? as usize;
    let instance_len = *block.get(at + 3)?;
    let name_start = at + 4;
    let name = block.get(name_start..name_start + name_len)?.to_vec();
    let instance_start = name_start + name_len;

    let (instance, end) = match instance_len {
        255 => (None, instance_start),
        0 => (Some(SmolStr::new_static("*")), instance_start),
        len => {
            let end = instance_start + len as usize;
            let instance = std::str::from_utf8(block.get(instance_start..end)?).ok()?;
            (Some(SmolStr::from(instance)), end)
        }
    };
    Some((Some(Target { kind, name, instance }), end))
}

fn check_magic(block: &[u8]) -> Result<(), FrameError> {
    if block.len() < SENDER_OFFSET || block[..2] != MAGIC {
        return Err(FrameError::MalformedBlock);
    }
    Ok(())
}

/// Overwrites the routing TTL of a framed block.
pub fn set_header_ttl(block: &mut [u8], ttl: u8) -> Result<(), FrameError> {
    check_magic(block)?;
    block[TTL_OFFSET] = ttl;
    Ok(())
}

/// Sender of a framed block, `None` if it was sent anonymously.
pub fn extract_header_sender(block: &[u8]) -> Result<Option<Target>, FrameError> {
    check_magic(block)?;
    read_sender(block, SENDER_OFFSET)
        .map(|(sender, _)| sender)
        .ok_or(FrameError::MalformedBlock)
}

/// Readdresses a framed block to `targets`.
///
/// A receiver keeps the key the old list carried for the same target. The
/// signed header, body and signature are copied unchanged; only the receiver
/// list and the size field are rewritten.
pub fn update_header_receivers(block: &[u8], targets: &[Target]) -> Result<Vec<u8>, FrameError> {
    check_magic(block)?;
    let (_, list_start) = read_sender(block, SENDER_OFFSET).ok_or(FrameError::MalformedBlock)?;
    let old_len = match block.get(list_start..list_start + 2) {
        Some(field) => u16::from_le_bytes([field[0], field[1]]),
        None => return Err(FrameError::MalformedBlock),
    };
    let (old, rest_start) = if old_len == FLOOD_MARKER {
        (Vec::new(), list_start + 2)
    } else {
        let end = list_start + 2 + old_len as usize;
        let list = block.get(list_start + 2..end).ok_or(FrameError::MalformedBlock)?;
        (read_receiver_list(list).ok_or(FrameError::MalformedBlock)?, end)
    };

    let receivers: Vec<Receiver> = targets
        .iter()
        .map(|target| Receiver {
            target: target.clone(),
            key: old.iter().find(|r| r.target == *target).and_then(|r| r.key.clone()),
        })
        .collect();
    let list = if receivers.is_empty() {
        Vec::new()
    } else {
        receiver_list(&receivers)?
    };
    let len =
        u16::try_from(list.len()).map_err(|_| FrameError::TargetNameTooLong("receiver list".to_string()))?;

    let mut out = Vec::with_capacity(block.len() - rest_start + list_start + 2 + list.len());
    out.extend_from_slice(&block[..list_start]);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&list);
    out.extend_from_slice(&block[rest_start..]);
    let size = u16::try_from(out.len()).unwrap_or(0);
    out[SIZE_OFFSET..SIZE_OFFSET + 2].copy_from_slice(&size.to_le_bytes());

    tracing::debug!(receivers = targets.len(), size = out.len(), "readdressed block");
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Body { body: Vec<u8>, end_of_scope: bool },
    /// The empty block announcing that the last block follows.
    LastFollows,
}

/// Lazily framed sequence of blocks for one compile call.
///
/// An empty block always precedes the last block of a stream.
///
/// Blocks are framed (and their counters advanced) only when pulled, so the
/// stream can not be restarted.
#[derive(Debug)]
pub struct BlockStream {
    context: Option<FrameContext>,
    pending: VecDeque<Pending>,
    source_code: String,
}

impl BlockStream {
    /// Splits `body` into chunks of `chunk_size` bytes.
    pub(crate) fn split(
        context: Option<FrameContext>,
        body: &[u8],
        chunk_size: usize,
        end_of_scope: bool,
        source_code: &str,
    ) -> Self {
        let chunks: Vec<&[u8]> = body.chunks(chunk_size.max(1)).collect();
        let count = chunks.len();
        let mut pending = VecDeque::with_capacity(count + 1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let last = i + 1 == count;
            if last {
                pending.push_back(Pending::LastFollows);
            }
            pending.push_back(Pending::Body {
                body: chunk.to_vec(),
                end_of_scope: last && end_of_scope,
            });
        }
        tracing::debug!(chunks = count, chunk_size, "split block");
        Self {
            context,
            pending,
            source_code: source_code.to_string(),
        }
    }

    /// A stream from already separated bodies: every body but the last is
    /// sent with end-of-scope unset.
    pub(crate) fn from_bodies(
        context: Option<FrameContext>,
        bodies: Vec<Vec<u8>>,
        end_of_scope: bool,
        source_code: &str,
    ) -> Self {
        let count = bodies.len();
        let mut pending = VecDeque::with_capacity(count + 1);
        for (i, body) in bodies.into_iter().enumerate() {
            let last = i + 1 == count;
            if last {
                pending.push_back(Pending::LastFollows);
            }
            pending.push_back(Pending::Body {
                body,
                end_of_scope: last && end_of_scope,
            });
        }
        Self {
            context,
            pending,
            source_code: source_code.to_string(),
        }
    }

    /// Number of blocks still to come, including the announcement block.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl Iterator for BlockStream {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pending.pop_front()? {
            Pending::LastFollows => Some(Ok(Vec::new())),
            Pending::Body { body, end_of_scope } => match &self.context {
                None => Some(Ok(body)),
                Some(context) => Some(
                    context
                        .frame(&body, end_of_scope)
                        .map_err(|cause| Error::from_error(self.source_code.as_str(), cause, 0)),
                ),
            },
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.pending.len()))
    }
}

/// Result of a compile call.
#[derive(Debug)]
pub enum Output {
    Block(Vec<u8>),
    Blocks(BlockStream),
}

impl Output {
    /// Collects all blocks, dropping the empty announcement block.
    pub fn into_blocks(self) -> Result<Vec<Vec<u8>>, Error> {
        match self {
            Output::Block(block) => Ok(vec![block]),
            Output::Blocks(stream) => stream.filter(|b| !matches!(b, Ok(b) if b.is_empty())).collect(),
        }
    }

    /// The single block, or `None` for a split result.
    pub fn block(&self) -> Option<&[u8]> {
        match self {
            Output::Block(block) => Some(block),
            Output::Blocks(_) => None,
        }
    }
}

/// Offsets into a framed block, used to pull it apart again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BlockLayout {
    pub size: u16,
    pub crypto_flag: u8,
    /// Offset of the signed header.
    pub header_start: usize,
    pub body_start: usize,
    pub body_end: usize,
}

impl BlockLayout {
    /// Reads the routing prefix of an unencrypted block.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < 8 || block[..2] != MAGIC {
            return None;
        }
        let size = u16::from_le_bytes([block[3], block[4]]);
        let crypto_flag = block[7];
        let (_, mut i) = read_sender(block, SENDER_OFFSET)?;

        let receivers = u16::from_le_bytes([*block.get(i)?, *block.get(i + 1)?]);
        i += 2;
        if receivers != FLOOD_MARKER {
            i += receivers as usize;
        }

        let header_start = i;
        let iv = if matches!(crypto_flag, 2 | 3) { IV_SIZE } else { 0 };
        let body_start = header_start + SIGNED_HEADER_SIZE + iv;
        let signature = if matches!(crypto_flag, 1 | 2) { SIGNATURE_SIZE } else { 0 };
        let body_end = block.len().checked_sub(signature)?;
        (body_start <= body_end).then_some(Self {
            size,
            crypto_flag,
            header_start,
            body_start,
            body_end,
        })
    }

    pub fn sid(&self, block: &[u8]) -> u32 {
        let s = self.header_start;
        u32::from_le_bytes([block[s], block[s + 1], block[s + 2], block[s + 3]])
    }

    pub fn return_index(&self, block: &[u8]) -> u16 {
        u16::from_le_bytes([block[self.header_start + 4], block[self.header_start + 5]])
    }

    pub fn inc(&self, block: &[u8]) -> u16 {
        u16::from_le_bytes([block[self.header_start + 6], block[self.header_start + 7]])
    }

    pub fn data_type(&self, block: &[u8]) -> u8 {
        block[self.header_start + 8]
    }

    pub fn flags(&self, block: &[u8]) -> u8 {
        block[self.header_start + 9]
    }

    pub fn end_of_scope(&self, block: &[u8]) -> bool {
        self.flags(block) & 0b0010_0000 != 0
    }

    pub fn body<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[self.body_start..self.body_end]
    }
}
