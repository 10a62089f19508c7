/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Inbound framing.
//!
//! A [`Framer`] splits the inbound byte stream of a channel into frames
//! before they enter the handler pipeline. Any tokio-util [`Decoder`]
//! producing `BytesMut` frames is a framer. [`FixFramer`] frames FIX
//! tag=value messages using BeginString, BodyLength and CheckSum.

use bytes::BytesMut;
use ironsim_core::ChannelError;
use memchr::memchr;
use std::fmt;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// SOH delimiter.
pub const SOH: u8 = 0x01;

/// Errors that can occur while framing inbound bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Invalid BeginString field.
    #[error("invalid begin string: message must start with 8=")]
    InvalidBeginString,

    /// Missing BodyLength field.
    #[error("missing body length field (tag 9)")]
    MissingBodyLength,

    /// Invalid BodyLength value.
    #[error("invalid body length value")]
    InvalidBodyLength,

    /// Invalid CheckSum value.
    #[error("invalid checksum field")]
    InvalidChecksum,

    /// Checksum mismatch.
    #[error("checksum mismatch: calculated {calculated}, declared {declared}")]
    ChecksumMismatch {
        /// Calculated checksum.
        calculated: u8,
        /// Declared checksum in message.
        declared: u8,
    },

    /// Message exceeds maximum size.
    #[error("message too large: {size} bytes exceeds maximum {max_size}")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// I/O error.
    #[error("io: {0}")]
    Io(String),
}

// Required by the `Decoder` bound `type Error: From<std::io::Error>`; do not remove.
impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        Self::Framing(err.to_string())
    }
}

/// Splits a byte stream into frames.
pub trait Framer: Send + fmt::Debug {
    /// Removes the next complete frame from `src`, if there is one.
    ///
    /// # Errors
    /// Returns an error if the buffered bytes can never form a valid frame.
    fn next_frame(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, CodecError>;
}

impl<D> Framer for D
where
    D: Decoder<Item = BytesMut, Error = CodecError> + Send + fmt::Debug,
{
    fn next_frame(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        self.decode(src)
    }
}

/// Calculates the FIX checksum: the sum of all bytes modulo 256.
#[inline]
#[must_use]
pub fn calculate_checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
    (sum % 256) as u8
}

/// Parses a 3-digit checksum string.
#[inline]
#[must_use]
pub fn parse_checksum(bytes: &[u8]) -> Option<u8> {
    if bytes.len() != 3 {
        return None;
    }
    let mut value: u16 = 0;
    for &b in bytes {
        let digit = b.checked_sub(b'0')?;
        if digit > 9 {
            return None;
        }
        value = value * 10 + u16::from(digit);
    }
    u8::try_from(value).ok()
}

/// Frames FIX tag=value messages.
#[derive(Debug, Clone)]
pub struct FixFramer {
    /// Maximum message size in bytes.
    max_message_size: usize,
    /// Whether to validate checksums.
    validate_checksum: bool,
}

impl FixFramer {
    /// Creates a new framer with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            validate_checksum: true,
        }
    }

    /// Sets the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets whether to validate checksums.
    #[must_use]
    pub const fn with_checksum_validation(mut self, validate: bool) -> Self {
        self.validate_checksum = validate;
        self
    }
}

impl Default for FixFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FixFramer {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        if &src[0..2] != b"8=" {
            return Err(CodecError::InvalidBeginString);
        }

        let Some(first_soh) = memchr(SOH, src) else {
            return Ok(None);
        };

        let body_len_start = first_soh + 1;
        if src.len() < body_len_start + 2 {
            return Ok(None);
        }
        if &src[body_len_start..body_len_start + 2] != b"9=" {
            return Err(CodecError::MissingBodyLength);
        }

        let Some(offset) = memchr(SOH, &src[body_len_start..]) else {
            return Ok(None);
        };
        let body_len_soh = body_len_start + offset;

        let body_length: usize = std::str::from_utf8(&src[body_len_start + 2..body_len_soh])
            .map_err(|_| CodecError::InvalidBodyLength)?
            .parse()
            .map_err(|_| CodecError::InvalidBodyLength)?;

        // Trailer is "10=XXX<SOH>".
        let total_length = body_len_soh + 1 + body_length + 7;
        if total_length > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: total_length,
                max_size: self.max_message_size,
            });
        }

        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let trailer_start = total_length - 7;
        if &src[trailer_start..trailer_start + 3] != b"10=" || src[total_length - 1] != SOH {
            return Err(CodecError::InvalidChecksum);
        }

        if self.validate_checksum {
            let declared = parse_checksum(&src[trailer_start + 3..total_length - 1])
                .ok_or(CodecError::InvalidChecksum)?;
            let calculated = calculate_checksum(&src[..trailer_start]);
            if calculated != declared {
                return Err(CodecError::ChecksumMismatch {
                    calculated,
                    declared,
                });
            }
        }

        Ok(Some(src.split_to(total_length)))
    }
}
