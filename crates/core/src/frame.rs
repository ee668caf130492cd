use std::{fmt, num::NonZeroU32};

/// Four-character code describing a pixel/stream format.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"RGBA");
/// assert_eq!(fcc.to_string(), "RGBA");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

/// Resolution of a stream.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::Resolution;
///
/// let res = Resolution::new(1280, 720).unwrap();
/// assert_eq!(res.height.get(), 720);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

/// Active stream configuration of a hardware camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamConfig {
    /// Stream id assigned by the hardware layer.
    pub id: i32,
    pub resolution: Resolution,
    pub format: FourCc,
    /// Buffer usage bits, opaque to the broker.
    pub usage: u64,
    /// Rotation in degrees.
    pub rotation: u32,
}

/// Descriptor for one hardware frame buffer.
///
/// The broker forwards descriptors only; pixel data stays in the buffer the
/// hardware layer owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameDesc {
    /// Hardware buffer id.
    pub buffer_id: u32,
    /// Capture timestamp in nanoseconds.
    pub timestamp: i64,
}

impl FrameDesc {
    pub fn new(buffer_id: u32, timestamp: i64) -> Self {
        Self {
            buffer_id,
            timestamp,
        }
    }
}
