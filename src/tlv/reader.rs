//! TLV parsing with destructive in-place reassembly.

use crate::tlv::SEPARATOR;
use crate::utils::HexSlice;
use crate::Error;
use core::mem;

/// A parsed logical TLV item.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// The type byte.
    pub ty: u8,
    /// The reassembled value.
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Returns whether this is a zero-length separator item.
    pub fn is_separator(&self) -> bool {
        self.ty == SEPARATOR && self.value.is_empty()
    }
}

/// Slot describing one TLV type expected by [`TlvReader::get_all`].
///
/// [`TlvReader::get_all`]: struct.TlvReader.html#method.get_all
pub struct ExpectedTlv<'a> {
    /// The type to collect.
    pub ty: u8,
    /// Filled with the item's value when present in the buffer.
    pub value: Option<&'a [u8]>,
}

impl<'a> ExpectedTlv<'a> {
    /// Creates an empty slot for `ty`.
    pub fn new(ty: u8) -> Self {
        ExpectedTlv { ty, value: None }
    }
}

/// Reads logical TLV items out of a caller-owned buffer.
///
/// Reassembly happens in place: consecutive fragments of the same type are merged by moving
/// their bodies over the intermediate headers, so returned value slices are contiguous views
/// into the original buffer. The vacated bytes are zeroed.
pub struct TlvReader<'a> {
    buf: &'a mut [u8],
}

impl<'a> TlvReader<'a> {
    /// Creates a reader over `buf`, which must contain exactly the TLV data to parse.
    pub fn new(buf: &'a mut [u8]) -> Self {
        TlvReader { buf }
    }

    /// Returns whether all items have been consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reads the next logical item, merging long-TLV fragments.
    ///
    /// Returns `Ok(None)` at the end of the buffer and `Error::InvalidData` on a truncated
    /// fragment.
    pub fn next_tlv(&mut self) -> Result<Option<Tlv<'a>>, Error> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let this = mem::replace(&mut self.buf, &mut []);
        if this.len() < 2 {
            info!("found incomplete TLV fragment header with length {}", this.len());
            return Err(Error::InvalidData);
        }

        let ty = this[0];
        let mut value_len = this[1] as usize;
        if this.len() - 2 < value_len {
            info!("found incomplete TLV fragment body with length {}", this.len() - 2);
            return Err(Error::InvalidData);
        }

        // `consumed` tracks the wire bytes belonging to this logical item, `value_len` the
        // merged value accumulated at offset 2.
        let mut consumed = 2 + value_len;
        loop {
            let rest = &this[consumed..];
            if rest.len() < 2 || rest[0] != ty {
                break;
            }
            let fragment_len = rest[1] as usize;
            if rest.len() - 2 < fragment_len {
                info!("found incomplete TLV fragment body with length {}", rest.len() - 2);
                return Err(Error::InvalidData);
            }

            // Move the fragment body over the fragment header, extending the merged value.
            this.copy_within(consumed + 2..consumed + 2 + fragment_len, 2 + value_len);
            value_len += fragment_len;
            consumed += 2 + fragment_len;
        }

        // Zero the gap the moved fragment bodies left behind.
        for b in &mut this[2 + value_len..consumed] {
            *b = 0;
        }

        let (item, rest) = this.split_at_mut(consumed);
        self.buf = rest;
        // Shed mutability while keeping the full buffer lifetime, so multiple items can be
        // borrowed at once.
        let item: &'a [u8] = item;
        Ok(Some(Tlv {
            ty,
            value: &item[2..2 + value_len],
        }))
    }

    /// Consumes the whole buffer, filling `expected` with the values of the listed types.
    ///
    /// Duplicate occurrences of an expected type are rejected as `Error::InvalidData`. Items of
    /// types not listed are skipped with an info log.
    pub fn get_all(mut self, expected: &mut [ExpectedTlv<'a>]) -> Result<(), Error> {
        while let Some(tlv) = self.next_tlv()? {
            match expected.iter_mut().find(|slot| slot.ty == tlv.ty) {
                Some(slot) => {
                    if slot.value.is_some() {
                        info!("duplicate TLV type {:#04x}", tlv.ty);
                        return Err(Error::InvalidData);
                    }
                    slot.value = Some(tlv.value);
                }
                None => {
                    info!("skipping unexpected TLV type {:#04x} {:?}", tlv.ty, HexSlice(tlv.value));
                }
            }
        }
        Ok(())
    }
}

/// Maximum number of logical items a [`TlvIndex`] can hold.
pub const MAX_INDEXED_TLVS: usize = 32;

/// Non-sequential access to a TLV buffer.
///
/// Construction consumes the whole buffer once, indexing every logical item for later lookup by
/// type.
pub struct TlvIndex<'a> {
    items: heapless::Vec<Tlv<'a>, MAX_INDEXED_TLVS>,
}

impl<'a> TlvIndex<'a> {
    /// Indexes all items remaining in `reader`.
    ///
    /// Duplicate types are rejected as `Error::InvalidData`; more than [`MAX_INDEXED_TLVS`]
    /// distinct items report `Error::OutOfResources`.
    pub fn new(mut reader: TlvReader<'a>) -> Result<Self, Error> {
        let mut items: heapless::Vec<Tlv<'a>, MAX_INDEXED_TLVS> = heapless::Vec::new();
        while let Some(tlv) = reader.next_tlv()? {
            if items.iter().any(|item| item.ty == tlv.ty) {
                info!("duplicate TLV type {:#04x}", tlv.ty);
                return Err(Error::InvalidData);
            }
            items.push(tlv).map_err(|_| Error::OutOfResources)?;
        }
        Ok(TlvIndex { items })
    }

    /// Looks up the value of the item with type `ty`.
    pub fn find(&self, ty: u8) -> Option<&'a [u8]> {
        self.items.iter().find(|item| item.ty == ty).map(|item| item.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_simple_items() {
        let mut buf = [0x01, 0x02, 0xaa, 0xbb, 0x07, 0x00, 0xff, 0x00];
        let mut reader = TlvReader::new(&mut buf);

        let tlv = reader.next_tlv().unwrap().unwrap();
        assert_eq!(tlv.ty, 0x01);
        assert_eq!(tlv.value, &[0xaa, 0xbb]);

        let tlv = reader.next_tlv().unwrap().unwrap();
        assert_eq!(tlv.ty, 0x07);
        assert_eq!(tlv.value, &[]);

        let tlv = reader.next_tlv().unwrap().unwrap();
        assert!(tlv.is_separator());

        assert!(reader.next_tlv().unwrap().is_none());
    }

    #[test]
    fn reassembles_long_tlvs() {
        // 300-byte value split into a 255-byte and a 45-byte fragment.
        let mut buf = std::vec::Vec::new();
        buf.push(0x09);
        buf.push(255);
        buf.extend((0..255u32).map(|i| i as u8));
        buf.push(0x09);
        buf.push(45);
        buf.extend((255..300u32).map(|i| i as u8));
        buf.extend(&[0x02, 0x01, 0x77]);

        let mut reader = TlvReader::new(&mut buf);
        let tlv = reader.next_tlv().unwrap().unwrap();
        assert_eq!(tlv.ty, 0x09);
        assert_eq!(tlv.value.len(), 300);
        for (i, b) in tlv.value.iter().enumerate() {
            assert_eq!(*b, i as u8);
        }

        let tlv = reader.next_tlv().unwrap().unwrap();
        assert_eq!(tlv.ty, 0x02);
        assert_eq!(tlv.value, &[0x77]);
        assert!(reader.next_tlv().unwrap().is_none());
    }

    #[test]
    fn rejects_truncated_fragments() {
        let mut buf = [0x01, 0x05, 0xaa];
        let mut reader = TlvReader::new(&mut buf);
        assert_eq!(reader.next_tlv(), Err(Error::InvalidData));

        let mut buf = [0x01];
        let mut reader = TlvReader::new(&mut buf);
        assert_eq!(reader.next_tlv(), Err(Error::InvalidData));
    }

    #[test]
    fn get_all_collects_and_skips() {
        let mut buf = [
            0x06, 0x01, 0x01, // state
            0x42, 0x01, 0x99, // unknown, skipped
            0x00, 0x01, 0x04, // method
        ];
        let reader = TlvReader::new(&mut buf);
        let mut expected = [ExpectedTlv::new(0x00), ExpectedTlv::new(0x06), ExpectedTlv::new(0x01)];
        reader.get_all(&mut expected).unwrap();
        assert_eq!(expected[0].value, Some(&[0x04][..]));
        assert_eq!(expected[1].value, Some(&[0x01][..]));
        assert_eq!(expected[2].value, None);
    }

    #[test]
    fn get_all_rejects_duplicates() {
        let mut buf = [0x06, 0x01, 0x01, 0x03, 0x00, 0x06, 0x01, 0x02];
        let reader = TlvReader::new(&mut buf);
        let mut expected = [ExpectedTlv::new(0x06)];
        assert_eq!(reader.get_all(&mut expected), Err(Error::InvalidData));
    }

    #[test]
    fn index_finds_items_in_any_order() {
        let mut buf = [0x01, 0x01, 0x11, 0x02, 0x01, 0x22, 0x03, 0x00];
        let index = TlvIndex::new(TlvReader::new(&mut buf)).unwrap();
        assert_eq!(index.find(0x02), Some(&[0x22][..]));
        assert_eq!(index.find(0x01), Some(&[0x11][..]));
        assert_eq!(index.find(0x03), Some(&[][..]));
        assert_eq!(index.find(0x04), None);
    }
}
