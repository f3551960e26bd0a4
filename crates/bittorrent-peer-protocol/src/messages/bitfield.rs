use bitvec::order::Msb0;
use bitvec::vec::BitVec;

/// Pieces held by a peer (or by us).
///
/// Bit `i`, counted from the most significant bit of the first byte, stands for piece `i`. The
/// backing buffer is always `ceil(piece_count / 8)` bytes long and spare bits are kept cleared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// An empty bitfield for `piece_count` pieces
    pub fn new(piece_count: usize) -> Self {
        Bitfield {
            bits: BitVec::repeat(false, piece_count),
        }
    }

    /// Wraps raw wire bytes. The bit length is `8 * bytes.len()` until narrowed with
    /// [`Bitfield::with_piece_count`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Bitfield {
            bits: BitVec::from_slice(bytes),
        }
    }

    /// Resizes the bitfield to exactly `piece_count` bits, dropping any spare bits a peer sent
    /// and padding a short bitfield with zeros.
    pub fn with_piece_count(mut self, piece_count: usize) -> Self {
        self.bits.resize(piece_count, false);
        self.bits.set_uninitialized(false);
        self
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bits.get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// Marks `index` as held. Setting an already set bit is a no-op, indices past the end are
    /// ignored.
    pub fn set_piece(&mut self, index: usize) {
        if let Some(mut bit) = self.bits.get_mut(index) {
            *bit = true;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    /// Indices of all held pieces, in ascending order
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}
