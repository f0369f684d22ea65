//! Data layout descriptors and argument packing.
//!
//! A descriptor is two characters: an alignment digit (`1` pointer-width,
//! `4` four bytes) and a pointer flag (`b` raw pointers can be passed,
//! `-` they cannot). Return values always use `4-`.

use std::fmt;
use std::str::FromStr;

use super::{ArgValue, DeviceCaps};
use crate::error::{BackendError, Result};
use crate::ir::{Param, Scalar};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    PointerWidth,
    Four,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataLayout {
    pub alignment: Alignment,
    pub raw_pointers: bool,
}

impl DataLayout {
    /// Layout of kernel return values on every backend.
    pub const RETURN: DataLayout = DataLayout {
        alignment: Alignment::Four,
        raw_pointers: false,
    };

    /// Argument layout negotiated from device capabilities.
    pub fn for_arguments(caps: &DeviceCaps) -> Self {
        DataLayout {
            alignment: Alignment::PointerWidth,
            raw_pointers: caps.raw_device_pointers,
        }
    }

    /// Size and alignment of an ndarray pointer slot, if pointers are passed.
    pub fn pointer_slot(&self) -> Option<(usize, usize)> {
        if !self.raw_pointers {
            return None;
        }
        let size = std::mem::size_of::<usize>();
        let align = match self.alignment {
            Alignment::PointerWidth => size,
            Alignment::Four => 4,
        };
        Some((size, align))
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digit = match self.alignment {
            Alignment::PointerWidth => '1',
            Alignment::Four => '4',
        };
        let flag = if self.raw_pointers { 'b' } else { '-' };
        write!(f, "{}{}", digit, flag)
    }
}

impl FromStr for DataLayout {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || BackendError::Config(format!("invalid data layout descriptor '{}'", s));
        let mut chars = s.chars();
        let alignment = match chars.next() {
            Some('1') => Alignment::PointerWidth,
            Some('4') => Alignment::Four,
            _ => return Err(bad()),
        };
        let raw_pointers = match chars.next() {
            Some('b') => true,
            Some('-') => false,
            _ => return Err(bad()),
        };
        if chars.next().is_some() {
            return Err(bad());
        }
        Ok(DataLayout {
            alignment,
            raw_pointers,
        })
    }
}

/// Byte placement of each kernel argument in the marshalled argument block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentLayout {
    /// Offset per parameter; `None` for ndarrays bound by slot.
    pub offsets: Vec<Option<usize>>,
    /// Total size, rounded up to 4 bytes.
    pub size: usize,
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Place each parameter under `layout`: scalars take 4 bytes at 4-byte
/// alignment, ndarrays take a pointer slot or nothing.
pub fn pack_arguments(params: &[Param], layout: &DataLayout) -> ArgumentLayout {
    let mut offset = 0usize;
    let mut offsets = Vec::with_capacity(params.len());
    for param in params {
        let slot = match param {
            Param::Scalar(dt) => Some((dt.size(), 4)),
            Param::NdArray(_) => layout.pointer_slot(),
        };
        match slot {
            Some((size, align)) => {
                let at = align_up(offset, align);
                offsets.push(Some(at));
                offset = at + size;
            }
            None => offsets.push(None),
        }
    }
    ArgumentLayout {
        offsets,
        size: align_up(offset, 4),
    }
}

impl ArgumentLayout {
    pub fn write_scalar(&self, buf: &mut [u8], index: usize, value: Scalar) -> Result<()> {
        let at = self.slot(index)?;
        buf.get_mut(at..at + 4)
            .ok_or_else(|| BackendError::Transfer("argument block too small".to_string()))?
            .copy_from_slice(&value.to_bits().to_le_bytes());
        Ok(())
    }

    pub fn write_pointer(&self, buf: &mut [u8], index: usize, address: usize) -> Result<()> {
        let at = self.slot(index)?;
        let bytes = address.to_ne_bytes();
        buf.get_mut(at..at + bytes.len())
            .ok_or_else(|| BackendError::Transfer("argument block too small".to_string()))?
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<usize> {
        self.offsets
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| BackendError::Transfer(format!("argument {} has no byte slot", index)))
    }

    /// Marshal the scalar arguments; pointer slots are left zeroed.
    pub fn marshal_scalars(&self, args: &[ArgValue]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size];
        for (i, arg) in args.iter().enumerate() {
            if let ArgValue::Scalar(v) = arg {
                self.write_scalar(&mut buf, i, *v)?;
            }
        }
        Ok(buf)
    }
}

/// Check that `args` match the kernel's parameters in count, kind and type.
pub fn check_args(kernel: &str, params: &[Param], args: &[ArgValue]) -> Result<()> {
    if params.len() != args.len() {
        return Err(BackendError::argument_mismatch(
            kernel,
            format!("expected {} arguments, got {}", params.len(), args.len()),
        ));
    }
    for (i, (param, arg)) in params.iter().zip(args).enumerate() {
        match (param, arg) {
            (Param::Scalar(dt), ArgValue::Scalar(v)) if v.dtype() == *dt => {}
            (Param::NdArray(_), ArgValue::NdArray(a))
                if a.kind == super::AllocationKind::Buffer => {}
            _ => {
                return Err(BackendError::argument_mismatch(
                    kernel,
                    format!("argument {} expects {:?}, got {:?}", i, param, arg),
                ))
            }
        }
    }
    Ok(())
}
