//! 帧编解码：纯函数的单帧编解码，以及带 3 字节长度前缀的流式 [`FrameCodec`]。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    Frame, FrameError, FrameType, HEADER_LEN, MAX_FRAME_LEN, MAX_STREAM_ID, SetupFrame, flags,
};
use crate::error::ErrorCode;
use crate::payload::Payload;

const LENGTH_PREFIX_LEN: usize = 3;
const MAX_METADATA_LEN: usize = 0x00ff_ffff;
const MAX_POSITION: u64 = 0x7fff_ffff_ffff_ffff;

/// 流式解码的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome<T> {
    /// 得到一个完整帧，对应字节已从缓冲中移除。
    Complete(T),
    /// 缓冲中的字节不足一帧，需要继续读取。
    Incomplete,
}

/// 把单帧（不含长度前缀）编码为字节。
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame_body_hint(frame));
    encode_into(frame, &mut buf);
    buf.freeze()
}

/// 校验帧的每个字段都能被线上格式无损表达，且解码端会接受它。
///
/// [`FrameCodec::encode`] 在写入前调用；通过校验的帧满足 `decode_frame(encode_frame(f)) == f`。
pub fn validate_frame(frame: &Frame) -> Result<(), FrameError> {
    let stream_id = frame.stream_id();
    if stream_id > MAX_STREAM_ID {
        return Err(FrameError::StreamIdOutOfRange(stream_id));
    }
    check_stream_id(frame.frame_type(), stream_id)?;
    match frame {
        Frame::Setup(setup) => {
            let max_u31 = u64::from(MAX_STREAM_ID);
            check_range(
                "keepalive interval",
                u64::from(setup.keepalive_interval_ms),
                max_u31,
            )?;
            check_range("max lifetime", u64::from(setup.max_lifetime_ms), max_u31)?;
            if let Some(token) = &setup.resume_token {
                check_range(
                    "resume token length",
                    token.len() as u64,
                    u64::from(u16::MAX),
                )?;
            }
            check_mime("metadata mime type", &setup.metadata_mime_type)?;
            check_mime("data mime type", &setup.data_mime_type)?;
            check_metadata(&setup.payload)
        }
        Frame::Keepalive {
            last_received_position,
            ..
        } => check_range("last received position", *last_received_position, MAX_POSITION),
        Frame::RequestResponse { payload, .. }
        | Frame::RequestFnf { payload, .. }
        | Frame::Payload { payload, .. } => check_metadata(payload),
        Frame::RequestStream {
            initial_n, payload, ..
        }
        | Frame::RequestChannel {
            initial_n, payload, ..
        } => {
            check_request_n(*initial_n)?;
            check_metadata(payload)
        }
        Frame::RequestN { n, .. } => check_request_n(*n),
        Frame::Cancel { .. } | Frame::Error { .. } | Frame::MetadataPush { .. } => Ok(()),
    }
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<(), FrameError> {
    if value > max {
        return Err(FrameError::ValueOutOfRange { field, value, max });
    }
    Ok(())
}

fn check_request_n(n: u32) -> Result<(), FrameError> {
    if n == 0 {
        return Err(FrameError::ZeroRequestN);
    }
    check_range("request n", u64::from(n), u64::from(MAX_STREAM_ID))
}

fn check_mime(field: &'static str, value: &str) -> Result<(), FrameError> {
    if !value.is_ascii() {
        return Err(FrameError::InvalidText {
            field,
            encoding: "ASCII",
        });
    }
    check_range(field, value.len() as u64, u64::from(u8::MAX))
}

fn check_metadata(payload: &Payload) -> Result<(), FrameError> {
    let len = payload.metadata().map_or(0, |metadata| metadata.len());
    check_range("metadata length", len as u64, MAX_METADATA_LEN as u64)
}

/// 把单帧（不含长度前缀）追加写入 `dst`。
///
/// 不做校验：越界字段按线上宽度截断。需要无损往返时先调用 [`validate_frame`]，
/// 或直接使用 [`FrameCodec::encode`]。
pub fn encode_into(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Setup(setup) => {
            let mut bits = payload_flags(&setup.payload);
            if setup.resume_token.is_some() {
                bits |= flags::RESUME;
            }
            if setup.lease {
                bits |= flags::LEASE;
            }
            put_header(dst, 0, FrameType::Setup, bits);
            dst.put_u16(setup.major_version);
            dst.put_u16(setup.minor_version);
            dst.put_u32(setup.keepalive_interval_ms & MAX_STREAM_ID);
            dst.put_u32(setup.max_lifetime_ms & MAX_STREAM_ID);
            if let Some(token) = &setup.resume_token {
                let token = &token[..token.len().min(u16::MAX as usize)];
                dst.put_u16(token.len() as u16);
                dst.put_slice(token);
            }
            put_short_string(dst, &setup.metadata_mime_type);
            put_short_string(dst, &setup.data_mime_type);
            put_payload(dst, &setup.payload);
        }
        Frame::Keepalive {
            respond,
            last_received_position,
            data,
        } => {
            let bits = if *respond { flags::RESPOND } else { 0 };
            put_header(dst, 0, FrameType::Keepalive, bits);
            dst.put_u64(*last_received_position & 0x7fff_ffff_ffff_ffff);
            dst.put_slice(data);
        }
        Frame::RequestResponse {
            stream_id,
            follows,
            payload,
        } => {
            let bits = payload_flags(payload) | follows_flag(*follows);
            put_header(dst, *stream_id, FrameType::RequestResponse, bits);
            put_payload(dst, payload);
        }
        Frame::RequestFnf {
            stream_id,
            follows,
            payload,
        } => {
            let bits = payload_flags(payload) | follows_flag(*follows);
            put_header(dst, *stream_id, FrameType::RequestFnf, bits);
            put_payload(dst, payload);
        }
        Frame::RequestStream {
            stream_id,
            follows,
            initial_n,
            payload,
        } => {
            let bits = payload_flags(payload) | follows_flag(*follows);
            put_header(dst, *stream_id, FrameType::RequestStream, bits);
            dst.put_u32(*initial_n & MAX_STREAM_ID);
            put_payload(dst, payload);
        }
        Frame::RequestChannel {
            stream_id,
            follows,
            complete,
            initial_n,
            payload,
        } => {
            let mut bits = payload_flags(payload) | follows_flag(*follows);
            if *complete {
                bits |= flags::COMPLETE;
            }
            put_header(dst, *stream_id, FrameType::RequestChannel, bits);
            dst.put_u32(*initial_n & MAX_STREAM_ID);
            put_payload(dst, payload);
        }
        Frame::RequestN { stream_id, n } => {
            put_header(dst, *stream_id, FrameType::RequestN, 0);
            dst.put_u32(*n & MAX_STREAM_ID);
        }
        Frame::Cancel { stream_id } => {
            put_header(dst, *stream_id, FrameType::Cancel, 0);
        }
        Frame::Payload {
            stream_id,
            follows,
            complete,
            next,
            payload,
        } => {
            let mut bits = payload_flags(payload) | follows_flag(*follows);
            if *complete {
                bits |= flags::COMPLETE;
            }
            if *next {
                bits |= flags::NEXT;
            }
            put_header(dst, *stream_id, FrameType::Payload, bits);
            put_payload(dst, payload);
        }
        Frame::Error {
            stream_id,
            code,
            message,
        } => {
            put_header(dst, *stream_id, FrameType::Error, 0);
            dst.put_u32(code.as_u32());
            dst.put_slice(message.as_bytes());
        }
        Frame::MetadataPush { metadata } => {
            put_header(dst, 0, FrameType::MetadataPush, flags::METADATA);
            dst.put_slice(metadata);
        }
    }
}

/// 解码单帧（不含长度前缀）。
pub fn decode_frame(mut src: Bytes) -> Result<Frame, FrameError> {
    if src.len() < HEADER_LEN {
        return Err(FrameError::FrameTooShort(src.len()));
    }
    let raw_id = src.get_u32();
    if raw_id > MAX_STREAM_ID {
        return Err(FrameError::StreamIdOutOfRange(raw_id));
    }
    let type_and_flags = src.get_u16();
    let tag = (type_and_flags >> 10) as u8;
    let bits = type_and_flags & flags::MASK;
    let frame_type = FrameType::from_tag(tag).ok_or(FrameError::UnknownFrameType(tag))?;
    check_stream_id(frame_type, raw_id)?;

    let mut body = Cursor::new(src, frame_type.as_str());
    let stream_id = raw_id;
    let frame = match frame_type {
        FrameType::Setup => {
            let major_version = body.u16()?;
            let minor_version = body.u16()?;
            let keepalive_interval_ms = body.u32()? & MAX_STREAM_ID;
            let max_lifetime_ms = body.u32()? & MAX_STREAM_ID;
            let resume_token = if bits & flags::RESUME != 0 {
                let len = body.u16()? as usize;
                Some(body.take(len)?)
            } else {
                None
            };
            let metadata_mime_type = body.ascii("metadata mime type")?;
            let data_mime_type = body.ascii("data mime type")?;
            let payload = body.payload(bits)?;
            Frame::Setup(SetupFrame {
                major_version,
                minor_version,
                keepalive_interval_ms,
                max_lifetime_ms,
                resume_token,
                lease: bits & flags::LEASE != 0,
                metadata_mime_type,
                data_mime_type,
                payload,
            })
        }
        FrameType::Keepalive => Frame::Keepalive {
            respond: bits & flags::RESPOND != 0,
            last_received_position: body.u64()? & 0x7fff_ffff_ffff_ffff,
            data: body.rest(),
        },
        FrameType::RequestResponse => Frame::RequestResponse {
            stream_id,
            follows: bits & flags::FOLLOWS != 0,
            payload: body.payload(bits)?,
        },
        FrameType::RequestFnf => Frame::RequestFnf {
            stream_id,
            follows: bits & flags::FOLLOWS != 0,
            payload: body.payload(bits)?,
        },
        FrameType::RequestStream => Frame::RequestStream {
            stream_id,
            follows: bits & flags::FOLLOWS != 0,
            initial_n: body.request_n()?,
            payload: body.payload(bits)?,
        },
        FrameType::RequestChannel => Frame::RequestChannel {
            stream_id,
            follows: bits & flags::FOLLOWS != 0,
            complete: bits & flags::COMPLETE != 0,
            initial_n: body.request_n()?,
            payload: body.payload(bits)?,
        },
        FrameType::RequestN => Frame::RequestN {
            stream_id,
            n: body.request_n()?,
        },
        FrameType::Cancel => Frame::Cancel { stream_id },
        FrameType::Payload => Frame::Payload {
            stream_id,
            follows: bits & flags::FOLLOWS != 0,
            complete: bits & flags::COMPLETE != 0,
            next: bits & flags::NEXT != 0,
            payload: body.payload(bits)?,
        },
        FrameType::Error => {
            let code = ErrorCode::from_u32(body.u32()?);
            let message = String::from_utf8(body.rest().to_vec()).map_err(|_| {
                FrameError::InvalidText {
                    field: "error message",
                    encoding: "UTF-8",
                }
            })?;
            Frame::Error {
                stream_id,
                code,
                message,
            }
        }
        FrameType::MetadataPush => Frame::MetadataPush {
            metadata: body.rest(),
        },
    };
    Ok(frame)
}

/// 带 3 字节大端长度前缀的流式编解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：传输层交付的是任意切分的字节块，需要在连接级缓冲中逐帧切出；
/// - **契约 (What)**：`decode` 在字节不足时返回 [`DecodeOutcome::Incomplete`]；声明长度超过
///   `max_frame_size` 或短于帧头时立即返回错误，不再等待后续字节；
/// - **注意事项 (Trade-offs)**：解码出的帧通过 `split_to().freeze()` 与缓冲共享内存，
///   大载荷不发生复制。
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// `max_frame_size` 会被收敛到长度前缀可表达的上限。
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_LEN),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// 写出长度前缀与帧体；字段越界或帧体超过上限时不写入任何字节。
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        // === 教案级注释 ===
        // Why: 出站帧同样受帧长预算约束，超长帧若写出会让对端以 MalformedFrame 关闭连接。
        // How:
        // 0. `validate_frame` 拒绝无法无损表达的字段；
        // 1. 预留 3 字节长度前缀占位，直接把帧体编码进 `dst`，避免中间缓冲；
        // 2. 计算帧体长度，超限则回滚 `dst` 到写入前的长度并报错；
        // 3. 回填长度前缀。
        validate_frame(frame)?;
        let start = dst.len();
        dst.put_bytes(0, LENGTH_PREFIX_LEN);
        encode_into(frame, dst);
        let length = dst.len() - start - LENGTH_PREFIX_LEN;
        if length > self.max_frame_size {
            dst.truncate(start);
            return Err(FrameError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }
        let prefix = (length as u32).to_be_bytes();
        dst[start..start + LENGTH_PREFIX_LEN].copy_from_slice(&prefix[1..]);
        Ok(())
    }

    /// 尝试从 `src` 头部切出一帧。
    pub fn decode(&self, src: &mut BytesMut) -> Result<DecodeOutcome<Frame>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(DecodeOutcome::Incomplete);
        }
        let length = ((src[0] as usize) << 16) | ((src[1] as usize) << 8) | src[2] as usize;
        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }
        if length < HEADER_LEN {
            return Err(FrameError::FrameTooShort(length));
        }
        let total = LENGTH_PREFIX_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(DecodeOutcome::Incomplete);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let frame = src.split_to(length).freeze();
        decode_frame(frame).map(DecodeOutcome::Complete)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

fn put_header(dst: &mut BytesMut, stream_id: u32, frame_type: FrameType, bits: u16) {
    dst.put_u32(stream_id & MAX_STREAM_ID);
    dst.put_u16((u16::from(frame_type.tag()) << 10) | (bits & flags::MASK));
}

fn payload_flags(payload: &Payload) -> u16 {
    if payload.has_metadata() {
        flags::METADATA
    } else {
        0
    }
}

fn follows_flag(follows: bool) -> u16 {
    if follows { flags::FOLLOWS } else { 0 }
}

fn put_payload(dst: &mut BytesMut, payload: &Payload) {
    if let Some(metadata) = payload.metadata() {
        let metadata = &metadata[..metadata.len().min(MAX_METADATA_LEN)];
        dst.put_uint(metadata.len() as u64, 3);
        dst.put_slice(metadata);
    }
    if let Some(data) = payload.data() {
        dst.put_slice(data);
    }
}

fn put_short_string(dst: &mut BytesMut, value: &str) {
    let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}

fn frame_body_hint(frame: &Frame) -> usize {
    let payload_len = match frame {
        Frame::Setup(setup) => setup.payload.len() + 64,
        Frame::RequestResponse { payload, .. }
        | Frame::RequestFnf { payload, .. }
        | Frame::RequestStream { payload, .. }
        | Frame::RequestChannel { payload, .. }
        | Frame::Payload { payload, .. } => payload.len(),
        Frame::Keepalive { data, .. } => data.len(),
        Frame::Error { message, .. } => message.len(),
        Frame::MetadataPush { metadata } => metadata.len(),
        Frame::RequestN { .. } | Frame::Cancel { .. } => 0,
    };
    payload_len + 8
}

fn check_stream_id(frame_type: FrameType, stream_id: u32) -> Result<(), FrameError> {
    let valid = match frame_type {
        FrameType::Setup | FrameType::Keepalive | FrameType::MetadataPush => stream_id == 0,
        FrameType::Error => true,
        _ => stream_id != 0,
    };
    if valid {
        Ok(())
    } else {
        Err(FrameError::UnexpectedStreamId {
            frame_type,
            stream_id,
        })
    }
}

/// 帧体读取游标，所有读取先校验剩余长度。
struct Cursor {
    buf: Bytes,
    context: &'static str,
}

impl Cursor {
    fn new(buf: Bytes, context: &'static str) -> Self {
        Self { buf, context }
    }

    fn ensure(&self, needed: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < needed {
            return Err(FrameError::Truncated {
                context: self.context,
                needed: needed - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    fn u24(&mut self) -> Result<usize, FrameError> {
        self.ensure(3)?;
        Ok(self.buf.get_uint(3) as usize)
    }

    fn take(&mut self, len: usize) -> Result<Bytes, FrameError> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    fn request_n(&mut self) -> Result<u32, FrameError> {
        let n = self.u32()? & MAX_STREAM_ID;
        if n == 0 {
            return Err(FrameError::ZeroRequestN);
        }
        Ok(n)
    }

    fn ascii(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        if !raw.is_ascii() {
            return Err(FrameError::InvalidText {
                field,
                encoding: "ASCII",
            });
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn payload(&mut self, bits: u16) -> Result<Payload, FrameError> {
        let metadata = if bits & flags::METADATA != 0 {
            let len = self.u24()?;
            Some(self.take(len)?)
        } else {
            None
        };
        Ok(Payload::new(Some(self.rest()), metadata))
    }
}
