//! Registration interest bits.

use mio::Interest;

/// What a handler registration wants to be told about.
///
/// Connect interest is not expressible here: it is implied by registering
/// a [`crate::handler::Attachment::ConnectCallback`], which watches
/// writability under the hood and is consumed on first dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const READ: InterestSet = InterestSet(0b01);
    pub const WRITE: InterestSet = InterestSet(0b10);

    pub fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn to_mio(self) -> Interest {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }
}

impl std::ops::BitOr for InterestSet {
    type Output = InterestSet;

    fn bitor(self, rhs: InterestSet) -> InterestSet {
        InterestSet(self.0 | rhs.0)
    }
}
