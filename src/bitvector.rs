//! Packed boolean arrays for coil and discrete input payloads.
//!
//! Bits are packed LSB first: bit 0 is the least significant bit of byte 0,
//! bit 8 the least significant bit of byte 1, and so on. Padding bits in the
//! last byte are always zero.

use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Fixed-capacity sequence of bits with Modbus byte packing
#[derive(Clone, PartialEq, Eq, Default)]
pub struct BitVector {
    size: usize,
    data: Vec<u8>,
}

impl BitVector {
    /// Create a vector of `size` cleared bits
    pub fn new(size: usize) -> Self {
        Self {
            size,
            data: vec![0u8; packed_len(size)],
        }
    }

    /// Create a vector holding the given bits in order
    pub fn from_bools(bits: &[bool]) -> Self {
        let mut vector = Self::new(bits.len());
        for (index, &bit) in bits.iter().enumerate() {
            if bit {
                vector.data[index / 8] |= 1 << (index % 8);
            }
        }
        vector
    }

    /// Decode `bit_count` bits from their packed representation
    ///
    /// Extra bytes beyond `ceil(bit_count / 8)` are ignored and padding bits
    /// in the last byte are cleared.
    ///
    /// # Errors
    ///
    /// `ModbusError::Frame` if fewer bytes are supplied than `bit_count` needs.
    pub fn create(bytes: &[u8], bit_count: usize) -> ModbusResult<Self> {
        let needed = packed_len(bit_count);
        if bytes.len() < needed {
            return Err(ModbusError::frame(format!(
                "Need {} bytes for {} bits, got {}",
                needed,
                bit_count,
                bytes.len()
            )));
        }

        let mut data = bytes[..needed].to_vec();
        let used = bit_count % 8;
        if used != 0 {
            if let Some(last) = data.last_mut() {
                *last &= (1u8 << used) - 1;
            }
        }

        Ok(Self { size: bit_count, data })
    }

    /// Number of bits
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the vector holds no bits
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of bytes in the packed form
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Packed representation
    pub fn get_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Read one bit
    pub fn get_bit(&self, index: usize) -> ModbusResult<bool> {
        self.check_index(index)?;
        Ok(self.data[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Write one bit
    pub fn set_bit(&mut self, index: usize, value: bool) -> ModbusResult<()> {
        self.check_index(index)?;
        let mask = 1u8 << (index % 8);
        if value {
            self.data[index / 8] |= mask;
        } else {
            self.data[index / 8] &= !mask;
        }
        Ok(())
    }

    /// Iterate over the bits in order
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.size).map(move |i| self.data[i / 8] & (1 << (i % 8)) != 0)
    }

    /// Unpack into a `Vec<bool>`
    pub fn to_vec(&self) -> Vec<bool> {
        self.iter().collect()
    }

    /// Copy of the first `size` bits (or all of them if `size` is larger)
    pub fn truncated(&self, size: usize) -> Self {
        let size = size.min(self.size);
        // Cannot fail: the source holds at least packed_len(size) bytes.
        Self::create(&self.data, size).unwrap_or_else(|_| Self::new(size))
    }

    fn check_index(&self, index: usize) -> ModbusResult<()> {
        if index >= self.size {
            return Err(ModbusError::index_out_of_range(index, self.size));
        }
        Ok(())
    }
}

fn packed_len(bit_count: usize) -> usize {
    (bit_count + 7) / 8
}

impl fmt::Debug for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitVector[")?;
        for bit in self.iter() {
            write!(f, "{}", if bit { '1' } else { '0' })?;
        }
        write!(f, "]")
    }
}

impl From<&[bool]> for BitVector {
    fn from(bits: &[bool]) -> Self {
        Self::from_bools(bits)
    }
}
