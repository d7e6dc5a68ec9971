//! Endpoint signatures, converter-registry contract, and the format
//! compatibility gate.
//!
//! This crate intentionally knows nothing about concrete wire formats;
//! protocol plugins register conversion entries at boot and the dispatch core
//! only queries capability.

pub mod compat;
pub mod registry;
pub mod signature;

pub use compat::{CompatCheck, FormatAcceptance, is_format_compatible};
pub use registry::{
    ByteStream, ConversionEntry, ConversionTable, ConvertError, ConverterRegistry, identity_entry,
};
pub use signature::{
    EndpointSignature, KNOWN_FAMILIES, KNOWN_KINDS, SignatureError, normalize_or_default,
};
