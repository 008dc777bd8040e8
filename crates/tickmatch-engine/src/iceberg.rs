//! Iceberg hidden-reserve tracking.
//!
//! The parent order never rests on the book — only its current display
//! slice does, under the parent's id. The parent record here carries the
//! reservation backing the *undisplayed* remainder; the slice on the
//! book carries its own proportional share. A re-issued slice always
//! gets a fresh `accepted_ts`, so hidden quantity cannot hold a place in
//! the queue.

use std::collections::HashMap;

use tickmatch_types::{Amount, EngineError, Order, OrderId, Result, Side};

/// State of one live iceberg order.
#[derive(Debug, Clone)]
pub struct IcebergState {
    /// Parent record: `qty` is the full quantity, `filled_qty` the total
    /// executed across all slices, `reserved_*` backs only the
    /// undisplayed remainder.
    pub parent: Order,
    pub display_qty: Amount,
    /// Remaining quantity of the slice currently on the book.
    pub sliced_qty: Amount,
}

impl IcebergState {
    #[must_use]
    pub fn new(parent: Order, display_qty: Amount) -> Self {
        Self {
            parent,
            display_qty,
            sliced_qty: Amount::ZERO,
        }
    }

    /// Quantity not yet displayed or executed.
    #[must_use]
    pub fn hidden_qty(&self) -> Amount {
        Amount::from_raw(self.parent.remaining_qty().raw() - self.sliced_qty.raw())
    }

    /// Size of the next display slice.
    #[must_use]
    pub fn next_slice_qty(&self) -> Amount {
        self.display_qty.min(self.hidden_qty())
    }

    /// Carve the next display slice: moves the slice's reservation share
    /// from the parent onto the returned slice order, which the engine
    /// inserts into the book with a fresh `accepted_ts`.
    ///
    /// Returns `None` when nothing is left to display.
    ///
    /// # Errors
    /// Reservation-accounting failures, which indicate a bookkeeping bug.
    pub fn carve_slice(&mut self, accepted_ts: u64) -> Result<Option<Order>> {
        let slice_qty = self.next_slice_qty();
        if !slice_qty.is_positive() {
            return Ok(None);
        }
        let price = self
            .parent
            .limit_price
            .ok_or_else(|| EngineError::InvalidOrder {
                reason: "iceberg without limit price".to_string(),
            })?;

        let mut slice = self.parent.clone();
        slice.qty = slice_qty;
        slice.filled_qty = Amount::ZERO;
        slice.state = tickmatch_types::OrderState::Active;
        slice.accepted_ts = accepted_ts;
        slice.display_qty = Some(self.display_qty);
        match self.parent.side {
            Side::Buy => {
                let share = price.checked_mul(slice_qty)?;
                self.parent.consume_reserved_quote(share)?;
                slice.reserved_base = Amount::ZERO;
                slice.reserved_quote = share;
            }
            Side::Sell => {
                self.parent.consume_reserved_base(slice_qty)?;
                slice.reserved_base = slice_qty;
                slice.reserved_quote = Amount::ZERO;
            }
        }
        self.sliced_qty = Amount::from_raw(self.sliced_qty.raw() + slice_qty.raw());
        Ok(Some(slice))
    }

    /// Record `qty` executed out of the active slice.
    pub fn note_slice_fill(&mut self, qty: Amount) -> Result<()> {
        self.sliced_qty = Amount::from_raw(self.sliced_qty.raw() - qty.raw());
        self.parent.record_fill(qty)
    }
}

/// All live icebergs for one symbol, keyed by parent order id.
#[derive(Debug, Default)]
pub struct IcebergTable {
    entries: HashMap<OrderId, IcebergState>,
}

impl IcebergTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: IcebergState) {
        self.entries.insert(state.parent.id, state);
    }

    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.entries.contains_key(&order_id)
    }

    #[must_use]
    pub fn get(&self, order_id: OrderId) -> Option<&IcebergState> {
        self.entries.get(&order_id)
    }

    pub fn get_mut(&mut self, order_id: OrderId) -> Option<&mut IcebergState> {
        self.entries.get_mut(&order_id)
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<IcebergState> {
        self.entries.remove(&order_id)
    }

    /// Parent ids matching a predicate (session maintenance).
    pub fn ids_where(&self, pred: impl Fn(&Order) -> bool) -> Vec<OrderId> {
        self.entries
            .values()
            .filter(|s| pred(&s.parent))
            .map(|s| s.parent.id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tickmatch_types::OrderState;

    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn iceberg(side: Side, qty: &str, display: &str) -> IcebergState {
        let mut parent = Order::dummy_limit(side, amt("100"), amt(qty));
        parent.id = OrderId(1);
        parent.order_type = tickmatch_types::OrderType::Iceberg;
        parent.display_qty = Some(amt(display));
        IcebergState::new(parent, amt(display))
    }

    #[test]
    fn carve_moves_reservation_share() {
        let mut state = iceberg(Side::Buy, "10", "1");
        assert_eq!(state.parent.reserved_quote, amt("1000"));

        let slice = state.carve_slice(7).unwrap().unwrap();
        assert_eq!(slice.qty, amt("1"));
        assert_eq!(slice.accepted_ts, 7);
        assert_eq!(slice.reserved_quote, amt("100"));
        assert_eq!(state.parent.reserved_quote, amt("900"));
        assert_eq!(state.sliced_qty, amt("1"));
        assert_eq!(state.hidden_qty(), amt("9"));
    }

    #[test]
    fn final_slice_is_the_remainder() {
        let mut state = iceberg(Side::Sell, "2.5", "1");
        state.carve_slice(1).unwrap().unwrap();
        state.note_slice_fill(amt("1")).unwrap();
        state.carve_slice(2).unwrap().unwrap();
        state.note_slice_fill(amt("1")).unwrap();

        let last = state.carve_slice(3).unwrap().unwrap();
        assert_eq!(last.qty, amt("0.5"));
        assert_eq!(state.hidden_qty(), Amount::ZERO);
        assert!(state.carve_slice(4).unwrap().is_none());
    }

    #[test]
    fn slice_fill_advances_parent() {
        let mut state = iceberg(Side::Buy, "3", "1");
        state.carve_slice(1).unwrap().unwrap();
        state.note_slice_fill(amt("1")).unwrap();
        assert_eq!(state.parent.filled_qty, amt("1"));
        assert_eq!(state.parent.state, OrderState::PartiallyFilled);
        assert_eq!(state.sliced_qty, Amount::ZERO);
    }

    #[test]
    fn table_lookup_and_removal() {
        let mut table = IcebergTable::new();
        table.insert(iceberg(Side::Buy, "10", "1"));
        assert!(table.contains(OrderId(1)));
        assert_eq!(table.len(), 1);

        let removed = table.remove(OrderId(1)).unwrap();
        assert_eq!(removed.parent.id, OrderId(1));
        assert!(table.is_empty());
    }
}
