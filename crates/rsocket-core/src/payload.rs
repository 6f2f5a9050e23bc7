//! 请求与响应的载荷：可选数据段 + 可选元数据段。

use std::fmt;

use bytes::Bytes;

/// 不可变载荷。
///
/// # 教案式说明
/// - **契约 (What)**：元数据的“缺席”与“存在但为空”是两种不同状态，线上以 METADATA 标志位区分；
/// - **归一化 (How)**：线上格式不区分“无数据”与“空数据”，因此构造时把空数据段归一为缺席，
///   任意可构造的 `Payload` 编码后再解码都与原值相等。
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload {
    data: Option<Bytes>,
    metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: Option<Bytes>, metadata: Option<Bytes>) -> Self {
        Self {
            data: data.filter(|bytes| !bytes.is_empty()),
            metadata,
        }
    }

    /// 空载荷：无数据、无元数据。
    pub fn empty() -> Self {
        Self::default()
    }

    /// 仅含数据段的载荷。
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::new(Some(data.into()), None)
    }

    /// 替换元数据段。
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// 数据段按 UTF-8 解读；缺席或非法时返回 `None`。
    pub fn data_utf8(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// 元数据段按 UTF-8 解读；缺席或非法时返回 `None`。
    pub fn metadata_utf8(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// 数据与元数据的总字节数。
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len) + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.metadata.is_none()
    }

    pub fn into_parts(self) -> (Option<Bytes>, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .field("metadata_len", &self.metadata.as_ref().map(Bytes::len))
            .finish()
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::from_data(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::from_data(data)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::from_data(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::from_data(data)
    }
}
