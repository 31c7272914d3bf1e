//! Cells and bag-of-cells serialization
//!
//! Message bodies arrive as a serialized bag of cells (BOC). Each cell holds
//! up to 1023 data bits and up to four references to child cells. Only
//! ordinary cells are supported; exotic cells (pruned branches, library
//! references) never appear in the message bodies this service reads.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CellError, CellResult};

pub const MAX_BITS: usize = 1023;
pub const MAX_REFS: usize = 4;

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];
const FLAG_HAS_INDEX: u8 = 0x80;
const FLAG_HAS_CRC: u8 = 0x40;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl Cell {
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    /// Start reading from the first bit
    pub fn parse(&self) -> CellSlice<'_> {
        CellSlice {
            cell: self,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    pub fn from_boc_base64(encoded: &str) -> CellResult<Cell> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CellError::Unsupported(format!("BOC is not base64: {}", e)))?;
        Cell::from_boc(&bytes)
    }

    /// Deserialize a BOC and return its first root
    pub fn from_boc(bytes: &[u8]) -> CellResult<Cell> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.take(4)?;
        if magic != BOC_MAGIC {
            return Err(CellError::InvalidMagic(hex::encode(magic)));
        }

        let flags = reader.read_u8()?;
        let ref_size = (flags & 0x07) as usize;
        if ref_size == 0 || ref_size > 4 {
            return Err(CellError::Unsupported(format!("reference size {}", ref_size)));
        }
        let off_size = reader.read_u8()? as usize;
        if off_size == 0 || off_size > 8 {
            return Err(CellError::Unsupported(format!("offset size {}", off_size)));
        }

        let cell_count = reader.read_uint(ref_size)?;
        let root_count = reader.read_uint(ref_size)?;
        let _absent = reader.read_uint(ref_size)?;
        let total_size = reader.read_uint(off_size)?;

        if root_count == 0 {
            return Err(CellError::Unsupported("BOC without roots".to_string()));
        }
        // Every cell needs at least its two descriptor bytes
        if cell_count == 0 || cell_count > total_size / 2 {
            return Err(CellError::Unsupported(format!(
                "{} cells in {} bytes",
                cell_count, total_size
            )));
        }

        let root = reader.read_uint(ref_size)?;
        reader.take((root_count - 1) * ref_size)?;
        if flags & FLAG_HAS_INDEX != 0 {
            reader.take(cell_count * off_size)?;
        }
        let cells_data = reader.take(total_size)?;
        if flags & FLAG_HAS_CRC != 0 {
            // CRC32-C trailer is not verified
            reader.take(4)?;
        }

        let raw = parse_raw_cells(cells_data, cell_count, ref_size)?;

        // References always point forward, so build from the back
        let mut built: Vec<Option<Arc<Cell>>> = vec![None; cell_count];
        for (index, cell) in raw.into_iter().enumerate().rev() {
            let refs = cell
                .refs
                .iter()
                .map(|&reference| {
                    built[reference].clone().ok_or(CellError::InvalidRef {
                        cell: index,
                        reference,
                    })
                })
                .collect::<CellResult<Vec<_>>>()?;
            built[index] = Some(Arc::new(Cell {
                data: cell.data,
                bit_len: cell.bit_len,
                refs,
            }));
        }

        let root = built
            .get(root)
            .and_then(|cell| cell.clone())
            .ok_or(CellError::InvalidRef {
                cell: 0,
                reference: root,
            })?;
        Ok(Arc::try_unwrap(root).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Serialize as a single-root BOC without index or CRC
    pub fn to_boc(&self) -> Vec<u8> {
        let mut order = Vec::new();
        flatten(self, &mut order);

        let ref_size = bytes_needed(order.len() as u64);
        let mut cells = Vec::new();
        for (cell, refs) in &order {
            cells.extend_from_slice(&cell.descriptor());
            cells.extend_from_slice(&cell.tagged_data());
            for &reference in refs {
                write_uint(&mut cells, reference as u64, ref_size);
            }
        }
        let off_size = bytes_needed(cells.len() as u64);

        let mut out = Vec::with_capacity(cells.len() + 16);
        out.extend_from_slice(&BOC_MAGIC);
        out.push(ref_size as u8);
        out.push(off_size as u8);
        write_uint(&mut out, order.len() as u64, ref_size);
        write_uint(&mut out, 1, ref_size);
        write_uint(&mut out, 0, ref_size);
        write_uint(&mut out, cells.len() as u64, off_size);
        write_uint(&mut out, 0, ref_size);
        out.extend_from_slice(&cells);
        out
    }

    pub fn to_boc_base64(&self) -> String {
        STANDARD.encode(self.to_boc())
    }

    fn descriptor(&self) -> [u8; 2] {
        let d1 = self.refs.len() as u8;
        let d2 = (self.bit_len / 8 + self.bit_len.div_ceil(8)) as u8;
        [d1, d2]
    }

    /// Data bytes with the completion tag appended to a partial last byte
    fn tagged_data(&self) -> Vec<u8> {
        let mut data = self.data[..self.bit_len.div_ceil(8)].to_vec();
        if self.bit_len % 8 != 0 {
            data[self.bit_len / 8] |= 0x80 >> (self.bit_len % 8);
        }
        data
    }
}

struct RawCell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<usize>,
}

fn parse_raw_cells(bytes: &[u8], count: usize, ref_size: usize) -> CellResult<Vec<RawCell>> {
    let mut reader = ByteReader::new(bytes);
    let mut cells = Vec::with_capacity(count);

    for index in 0..count {
        let d1 = reader.read_u8()?;
        let d2 = reader.read_u8()?;

        if d1 & 0x08 != 0 {
            return Err(CellError::Unsupported(format!("exotic cell {}", index)));
        }
        let ref_count = (d1 & 0x07) as usize;
        if ref_count > MAX_REFS {
            return Err(CellError::Unsupported(format!(
                "cell {} has {} references",
                index, ref_count
            )));
        }
        if d1 & 0x10 != 0 {
            let hash_count = (d1 >> 5).count_ones() as usize + 1;
            reader.take(hash_count * (32 + 2))?;
        }

        let data_len = (d2 as usize).div_ceil(2);
        let mut data = reader.take(data_len)?.to_vec();
        let bit_len = if d2 % 2 == 0 {
            data_len * 8
        } else {
            let Some(last) = data.last_mut() else {
                return Err(CellError::Unsupported(format!("cell {} has no data", index)));
            };
            if *last == 0 {
                return Err(CellError::Unsupported(format!(
                    "cell {} lacks completion tag",
                    index
                )));
            }
            let padding = last.trailing_zeros() as usize;
            *last &= !(1u8 << padding);
            data_len * 8 - padding - 1
        };

        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let reference = reader.read_uint(ref_size)?;
            if reference <= index || reference >= count {
                return Err(CellError::InvalidRef {
                    cell: index,
                    reference,
                });
            }
            refs.push(reference);
        }

        cells.push(RawCell {
            data,
            bit_len,
            refs,
        });
    }

    Ok(cells)
}

/// Pre-order walk; children always land after their parent
fn flatten<'a>(cell: &'a Cell, out: &mut Vec<(&'a Cell, Vec<usize>)>) -> usize {
    let index = out.len();
    out.push((cell, Vec::new()));
    let refs: Vec<usize> = cell
        .refs
        .iter()
        .map(|child| flatten(child.as_ref(), out))
        .collect();
    out[index].1 = refs;
    index
}

fn bytes_needed(value: u64) -> usize {
    let mut n = 1;
    while n < 8 && value >= 1u64 << (8 * n) {
        n += 1;
    }
    n
}

fn write_uint(out: &mut Vec<u8>, value: u64, size: usize) {
    for i in (0..size).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CellResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CellError::UnexpectedEof(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CellResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_uint(&mut self, size: usize) -> CellResult<usize> {
        let bytes = self.take(size)?;
        Ok(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
    }
}

/// Read cursor over a cell's bits and references
#[derive(Debug, Clone, Copy)]
pub struct CellSlice<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellSlice<'a> {
    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.refs.len() - self.ref_pos
    }

    fn ensure_bits(&self, wanted: usize) -> CellResult<()> {
        let left = self.remaining_bits();
        if wanted > left {
            return Err(CellError::BitsExhausted { wanted, left });
        }
        Ok(())
    }

    pub fn load_bit(&mut self) -> CellResult<bool> {
        self.ensure_bits(1)?;
        let byte = self.cell.data[self.bit_pos / 8];
        let bit = (byte >> (7 - self.bit_pos % 8)) & 1;
        self.bit_pos += 1;
        Ok(bit == 1)
    }

    pub fn skip_bits(&mut self, bits: usize) -> CellResult<()> {
        self.ensure_bits(bits)?;
        self.bit_pos += bits;
        Ok(())
    }

    pub fn load_uint(&mut self, bits: usize) -> CellResult<u64> {
        if bits > 64 {
            return Err(CellError::Overflow(format!("{} bits into u64", bits)));
        }
        Ok(self.load_u128(bits)? as u64)
    }

    pub fn load_u128(&mut self, bits: usize) -> CellResult<u128> {
        if bits > 128 {
            return Err(CellError::Overflow(format!("{} bits into u128", bits)));
        }
        self.ensure_bits(bits)?;
        let mut value = 0u128;
        for _ in 0..bits {
            value = (value << 1) | self.load_bit()? as u128;
        }
        Ok(value)
    }

    pub fn load_u32(&mut self) -> CellResult<u32> {
        Ok(self.load_uint(32)? as u32)
    }

    pub fn load_bytes(&mut self, n: usize) -> CellResult<Vec<u8>> {
        self.ensure_bits(n * 8)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.load_uint(8)? as u8);
        }
        Ok(out)
    }

    /// `VarUInteger 16`: a 4-bit byte length followed by that many bytes
    pub fn load_coins(&mut self) -> CellResult<u128> {
        let len = self.load_uint(4)? as usize;
        self.load_u128(len * 8)
    }

    /// `MsgAddress`; `None` for `addr_none`
    pub fn load_address(&mut self) -> CellResult<Option<MsgAddress>> {
        match self.load_uint(2)? {
            0b00 => Ok(None),
            0b10 => {
                if self.load_bit()? {
                    return Err(CellError::Unsupported("anycast address".to_string()));
                }
                let workchain = self.load_uint(8)? as u8 as i8;
                let bytes = self.load_bytes(32)?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(MsgAddress { workchain, hash }))
            }
            0b01 => Err(CellError::Unsupported("external address".to_string())),
            _ => Err(CellError::Unsupported("variable-length address".to_string())),
        }
    }

    pub fn load_ref(&mut self) -> CellResult<&'a Cell> {
        let cell = self
            .cell
            .refs
            .get(self.ref_pos)
            .ok_or(CellError::MissingRef(self.ref_pos))?;
        self.ref_pos += 1;
        Ok(cell.as_ref())
    }

    /// `Either X ^X`: inline remainder on 0, referenced cell on 1
    pub fn load_either_ref(&mut self) -> CellResult<CellSlice<'a>> {
        if self.load_bit()? {
            Ok(self.load_ref()?.parse())
        } else {
            let inline = *self;
            self.bit_pos = self.cell.bit_len;
            self.ref_pos = self.cell.refs.len();
            Ok(inline)
        }
    }

    /// Whole bytes left in this cell, continuing through first references
    pub fn load_snake_bytes(&mut self) -> CellResult<Vec<u8>> {
        let mut out = self.load_bytes(self.remaining_bits() / 8)?;
        let mut next = if self.remaining_refs() > 0 {
            Some(self.load_ref()?)
        } else {
            None
        };
        while let Some(cell) = next {
            let mut slice = cell.parse();
            out.extend(slice.load_bytes(slice.remaining_bits() / 8)?);
            next = cell.refs.first().map(|child| child.as_ref());
        }
        Ok(out)
    }
}

/// Builder for a single cell
#[derive(Debug, Clone, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits_left(&self) -> usize {
        MAX_BITS - self.bit_len
    }

    pub fn store_bit(&mut self, bit: bool) -> CellResult<&mut Self> {
        if self.bit_len >= MAX_BITS {
            return Err(CellError::Overflow(format!("more than {} bits", MAX_BITS)));
        }
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let last = self.data.len() - 1;
            self.data[last] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    pub fn store_uint(&mut self, value: u64, bits: usize) -> CellResult<&mut Self> {
        if bits > 64 {
            return Err(CellError::Overflow(format!("{} bits from u64", bits)));
        }
        self.store_u128(value as u128, bits)
    }

    pub fn store_u128(&mut self, value: u128, bits: usize) -> CellResult<&mut Self> {
        if bits > 128 || (bits < 128 && value >> bits != 0) {
            return Err(CellError::Overflow(format!(
                "{} does not fit in {} bits",
                value, bits
            )));
        }
        if bits > self.bits_left() {
            return Err(CellError::Overflow(format!("more than {} bits", MAX_BITS)));
        }
        for i in (0..bits).rev() {
            self.store_bit((value >> i) & 1 == 1)?;
        }
        Ok(self)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> CellResult<&mut Self> {
        if bytes.len() * 8 > self.bits_left() {
            return Err(CellError::Overflow(format!("{} bytes do not fit", bytes.len())));
        }
        for &byte in bytes {
            self.store_uint(byte as u64, 8)?;
        }
        Ok(self)
    }

    pub fn store_coins(&mut self, amount: u128) -> CellResult<&mut Self> {
        let len = (128 - amount.leading_zeros() as usize).div_ceil(8);
        if len > 15 {
            return Err(CellError::Overflow(format!("coin amount {}", amount)));
        }
        self.store_uint(len as u64, 4)?;
        self.store_u128(amount, len * 8)
    }

    pub fn store_address(&mut self, address: Option<&MsgAddress>) -> CellResult<&mut Self> {
        match address {
            None => self.store_uint(0b00, 2),
            Some(addr) => {
                self.store_uint(0b10, 2)?;
                self.store_bit(false)?;
                self.store_uint(addr.workchain as u8 as u64, 8)?;
                self.store_bytes(&addr.hash)
            }
        }
    }

    pub fn store_ref(&mut self, cell: Cell) -> CellResult<&mut Self> {
        if self.refs.len() >= MAX_REFS {
            return Err(CellError::Overflow(format!("more than {} references", MAX_REFS)));
        }
        self.refs.push(Arc::new(cell));
        Ok(self)
    }

    /// Store as many whole bytes as fit here, the rest as a snake chain in a reference
    pub fn store_snake_bytes(&mut self, bytes: &[u8]) -> CellResult<&mut Self> {
        let fit = (self.bits_left() / 8).min(bytes.len());
        self.store_bytes(&bytes[..fit])?;
        if fit < bytes.len() {
            self.store_ref(snake_cell(&bytes[fit..])?)?;
        }
        Ok(self)
    }

    pub fn build(&self) -> Cell {
        Cell {
            data: self.data.clone(),
            bit_len: self.bit_len,
            refs: self.refs.clone(),
        }
    }
}

/// Chain of cells holding `bytes`, each continuing into its first reference
pub fn snake_cell(bytes: &[u8]) -> CellResult<Cell> {
    let mut tail: Option<Cell> = None;
    for chunk in bytes.chunks(MAX_BITS / 8).rev() {
        let mut builder = CellBuilder::new();
        builder.store_bytes(chunk)?;
        if let Some(next) = tail.take() {
            builder.store_ref(next)?;
        }
        tail = Some(builder.build());
    }
    Ok(tail.unwrap_or_default())
}

/// Standard internal address (`addr_std` without anycast)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl MsgAddress {
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    fn from_friendly(text: &str) -> Result<Self, CellError> {
        let bytes = URL_SAFE
            .decode(text)
            .or_else(|_| STANDARD.decode(text))
            .map_err(|_| CellError::InvalidAddress(text.to_string()))?;
        if bytes.len() != 36 {
            return Err(CellError::InvalidAddress(text.to_string()));
        }
        let expected = crc16(&bytes[..34]);
        if bytes[34..36] != expected.to_be_bytes() {
            return Err(CellError::InvalidAddress(format!("{} (bad checksum)", text)));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: bytes[1] as i8,
            hash,
        })
    }
}

impl fmt::Display for MsgAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workchain, hex::encode(self.hash))
    }
}

impl FromStr for MsgAddress {
    type Err = CellError;

    /// Accepts the raw `workchain:hex` form and the 48-character user-friendly form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((wc, hash_hex)) = s.split_once(':') else {
            return Self::from_friendly(s);
        };

        let workchain = wc
            .parse::<i8>()
            .map_err(|_| CellError::InvalidAddress(s.to_string()))?;
        let bytes = hex::decode(hash_hex).map_err(|_| CellError::InvalidAddress(s.to_string()))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CellError::InvalidAddress(s.to_string()))?;
        Ok(Self { workchain, hash })
    }
}

/// CRC-16/XMODEM, the checksum of user-friendly addresses
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
