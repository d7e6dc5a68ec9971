use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::signature::EndpointSignature;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("no converter registered for {src} -> {dst}")]
    Unsupported { src: String, dst: String },
    #[error("conversion failed: {0}")]
    Failed(String),
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ConvertError>>;

type RequestFn = Arc<dyn Fn(Bytes) -> Result<Bytes, ConvertError> + Send + Sync>;
type ResponseFn = Arc<dyn Fn(Bytes) -> Result<Bytes, ConvertError> + Send + Sync>;
type StreamFn = Arc<dyn Fn(ByteStream) -> ByteStream + Send + Sync>;

/// One registered direction: request converter and response converter are
/// mandatory, the streaming converter is optional.
#[derive(Clone)]
pub struct ConversionEntry {
    pub request: RequestFn,
    pub response: ResponseFn,
    pub stream: Option<StreamFn>,
}

/// Capability and conversion surface consumed by the dispatch core.
///
/// The core never parses wire formats itself; protocol plugins register
/// entries at boot and outer layers run the actual byte transformations.
pub trait ConverterRegistry: Send + Sync {
    fn can_convert_full(
        &self,
        src: &EndpointSignature,
        dst: &EndpointSignature,
        require_stream: bool,
    ) -> bool;

    fn convert_request(
        &self,
        body: Bytes,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Result<Bytes, ConvertError>;

    fn convert_response(
        &self,
        body: Bytes,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Result<Bytes, ConvertError>;

    fn convert_stream(
        &self,
        stream: ByteStream,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Result<ByteStream, ConvertError>;
}

/// Static conversion table populated by the explicit plugin list at program
/// start. No runtime discovery.
#[derive(Default)]
pub struct ConversionTable {
    entries: HashMap<(EndpointSignature, EndpointSignature), ConversionEntry>,
}

impl ConversionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        src: EndpointSignature,
        dst: EndpointSignature,
        entry: ConversionEntry,
    ) {
        self.entries.insert((src, dst), entry);
    }

    fn entry(
        &self,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Option<&ConversionEntry> {
        self.entries.get(&(src.clone(), dst.clone()))
    }
}

impl ConverterRegistry for ConversionTable {
    fn can_convert_full(
        &self,
        src: &EndpointSignature,
        dst: &EndpointSignature,
        require_stream: bool,
    ) -> bool {
        match self.entry(src, dst) {
            Some(entry) => !require_stream || entry.stream.is_some(),
            None => false,
        }
    }

    fn convert_request(
        &self,
        body: Bytes,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Result<Bytes, ConvertError> {
        let entry = self.entry(src, dst).ok_or_else(|| ConvertError::Unsupported {
            src: src.to_string(),
            dst: dst.to_string(),
        })?;
        (entry.request)(body)
    }

    fn convert_response(
        &self,
        body: Bytes,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Result<Bytes, ConvertError> {
        let entry = self.entry(src, dst).ok_or_else(|| ConvertError::Unsupported {
            src: src.to_string(),
            dst: dst.to_string(),
        })?;
        (entry.response)(body)
    }

    fn convert_stream(
        &self,
        stream: ByteStream,
        src: &EndpointSignature,
        dst: &EndpointSignature,
    ) -> Result<ByteStream, ConvertError> {
        let entry = self.entry(src, dst).ok_or_else(|| ConvertError::Unsupported {
            src: src.to_string(),
            dst: dst.to_string(),
        })?;
        let stream_fn = entry.stream.as_ref().ok_or_else(|| ConvertError::Unsupported {
            src: src.to_string(),
            dst: dst.to_string(),
        })?;
        Ok(stream_fn(stream))
    }
}

/// Identity entry useful for tests and same-data-format registrations.
pub fn identity_entry(with_stream: bool) -> ConversionEntry {
    ConversionEntry {
        request: Arc::new(Ok),
        response: Arc::new(Ok),
        stream: if with_stream {
            Some(Arc::new(|s: ByteStream| s))
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &str) -> EndpointSignature {
        s.parse().unwrap()
    }

    #[test]
    fn capability_requires_stream_entry_when_asked() {
        let mut table = ConversionTable::new();
        table.register(sig("claude:chat"), sig("openai:chat"), identity_entry(false));
        table.register(sig("claude:chat"), sig("gemini:chat"), identity_entry(true));

        assert!(table.can_convert_full(&sig("claude:chat"), &sig("openai:chat"), false));
        assert!(!table.can_convert_full(&sig("claude:chat"), &sig("openai:chat"), true));
        assert!(table.can_convert_full(&sig("claude:chat"), &sig("gemini:chat"), true));
        assert!(!table.can_convert_full(&sig("openai:chat"), &sig("claude:chat"), false));
    }

    #[test]
    fn convert_unregistered_direction_errors() {
        let table = ConversionTable::new();
        let err = table
            .convert_request(Bytes::from_static(b"{}"), &sig("claude:chat"), &sig("openai:chat"))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Unsupported { .. }));
    }
}
