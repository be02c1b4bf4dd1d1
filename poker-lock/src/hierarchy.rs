/// A class of lock, classified by the canonical hierarchy level it belongs
/// to. Acquisitions within one owner must never descend to a strictly
/// lower level than the deepest one already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    TableRead,
    TableWrite,
    Player,
    Pot,
    Deck,
    Betting,
    Wallet,
    Chat,
}

impl LockKind {
    /// Canonical hierarchy level: table_read=1, table_write=2, player=3,
    /// pot=4, deck=5, betting=5, wallet=6, chat=7. `deck` and `betting`
    /// intentionally share a level - acquiring one after the other is a
    /// same-level, always-permitted acquisition.
    pub fn level(&self) -> u8 {
        match self {
            LockKind::TableRead => 1,
            LockKind::TableWrite => 2,
            LockKind::Player => 3,
            LockKind::Pot => 4,
            LockKind::Deck => 5,
            LockKind::Betting => 5,
            LockKind::Wallet => 6,
            LockKind::Chat => 7,
        }
    }
}
