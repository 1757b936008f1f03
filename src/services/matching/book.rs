//! YES-space Order Book
//!
//! One book per market. Bids and asks are YES-space price levels; NO-side
//! intents were converted through the price map at admission. Levels are
//! price-ordered BTreeMaps of FIFO queues, so matching honours price-time
//! priority by construction.
//!
//! The book is mutated only by its market's writer. Matching is split into a
//! non-mutating `match_preview` walk and an `apply` step run after the ledger
//! transaction commits, so a failed commit leaves the book untouched.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::models::{OrderSide, Outcome};

use super::types::{BookSide, LevelView, Price, Qty};

/// A resting order as held by the book.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub order_id: Uuid,
    pub user_id: Uuid,
    /// Original intent; escrow and position accounting key off these.
    pub side: OrderSide,
    pub outcome: Outcome,
    /// Limit price in the order's own outcome space.
    pub limit_price: Price,
    /// Book-space level this entry rests at.
    pub yes_price: Price,
    pub quantity: Qty,
    pub filled: Qty,
    pub created_at_millis: i64,
}

impl BookEntry {
    pub fn remaining(&self) -> Qty {
        self.quantity - self.filled
    }
}

/// One maker consumed (fully or partially) by an incoming order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker: BookEntry,
    /// Maker's book-space price; this is the trade price.
    pub yes_price: Price,
    pub quantity: Qty,
}

/// Outcome of a non-mutating matching walk.
#[derive(Debug, Clone, Default)]
pub struct MatchPreview {
    pub fills: Vec<Fill>,
    /// Resting orders skipped because they belong to the incoming user.
    pub prevented: Vec<BookEntry>,
    pub remaining: Qty,
}

pub struct Book {
    market_id: Uuid,
    bids: BTreeMap<Price, VecDeque<BookEntry>>,
    asks: BTreeMap<Price, VecDeque<BookEntry>>,
    /// Order id to (side, level) for O(1) cancellation lookup.
    index: HashMap<Uuid, (BookSide, Price)>,
    last_trade_price: Option<Price>,
}

impl Book {
    pub fn new(market_id: Uuid) -> Self {
        Self {
            market_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            last_trade_price: None,
        }
    }

    pub fn market_id(&self) -> Uuid {
        self.market_id
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, order_id: &Uuid) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn last_trade_price(&self) -> Option<Price> {
        self.last_trade_price
    }

    pub fn set_last_trade_price(&mut self, price: Price) {
        self.last_trade_price = Some(price);
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    /// P(YES) as quoted by the book: last trade, else the mid of the best
    /// bid and ask, else 0.5 on an empty or one-sided book.
    pub fn implied_probability(&self) -> Decimal {
        if let Some(last) = self.last_trade_price {
            return last.to_decimal();
        }
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                (bid.to_decimal() + ask.to_decimal()) / Decimal::from(2)
            }
            _ => Decimal::new(5, 1),
        }
    }

    pub fn insert(&mut self, entry: BookEntry) {
        let book_side = super::types::book_side_of(entry.side, entry.outcome);
        let level = entry.yes_price;
        self.index.insert(entry.order_id, (book_side, level));
        let levels = match book_side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        levels.entry(level).or_default().push_back(entry);
    }

    pub fn get(&self, order_id: &Uuid) -> Option<&BookEntry> {
        let (side, level) = self.index.get(order_id)?;
        let levels = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        levels.get(level)?.iter().find(|e| e.order_id == *order_id)
    }

    pub fn remove(&mut self, order_id: &Uuid) -> Option<BookEntry> {
        let (side, level) = self.index.remove(order_id)?;
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        let queue = levels.get_mut(&level)?;
        let pos = queue.iter().position(|e| e.order_id == *order_id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            levels.remove(&level);
        }
        entry
    }

    /// Walk the opposite side for an incoming order without mutating the
    /// book. `limit` is the taker's YES-space bound; `None` means a market
    /// order that crosses every level. Resting orders owned by the taker are
    /// skipped, never matched.
    pub fn match_preview(
        &self,
        taker_user: Uuid,
        taker_side: BookSide,
        limit: Option<Price>,
        quantity: Qty,
    ) -> MatchPreview {
        let mut preview = MatchPreview {
            remaining: quantity,
            ..Default::default()
        };

        // Bid takers consume asks ascending; ask takers consume bids
        // descending. Collect level keys first so iteration order is fixed.
        let levels: Vec<Price> = match taker_side {
            BookSide::Bid => self.asks.keys().copied().collect(),
            BookSide::Ask => self.bids.keys().copied().collect(),
        };
        let levels: Box<dyn Iterator<Item = Price>> = match taker_side {
            BookSide::Bid => Box::new(levels.into_iter()),
            BookSide::Ask => Box::new(levels.into_iter().rev()),
        };

        for level in levels {
            if preview.remaining.is_zero() {
                break;
            }
            let crosses = match (taker_side, limit) {
                (_, None) => true,
                (BookSide::Bid, Some(l)) => level <= l,
                (BookSide::Ask, Some(l)) => level >= l,
            };
            if !crosses {
                break;
            }
            let queue = match taker_side {
                BookSide::Bid => &self.asks[&level],
                BookSide::Ask => &self.bids[&level],
            };
            for maker in queue {
                if preview.remaining.is_zero() {
                    break;
                }
                if maker.user_id == taker_user {
                    preview.prevented.push(maker.clone());
                    continue;
                }
                let fill_qty = preview.remaining.min(maker.remaining());
                if fill_qty.is_zero() {
                    continue;
                }
                preview.fills.push(Fill {
                    maker: maker.clone(),
                    yes_price: level,
                    quantity: fill_qty,
                });
                preview.remaining -= fill_qty;
            }
        }

        preview
    }

    /// Apply committed fills: bump maker fill counters, drop exhausted
    /// makers, record the last trade price.
    pub fn apply_fills(&mut self, fills: &[Fill]) {
        for fill in fills {
            let (side, level) = match self.index.get(&fill.maker.order_id) {
                Some(v) => *v,
                None => continue,
            };
            let levels = match side {
                BookSide::Bid => &mut self.bids,
                BookSide::Ask => &mut self.asks,
            };
            if let Some(queue) = levels.get_mut(&level) {
                if let Some(pos) = queue.iter().position(|e| e.order_id == fill.maker.order_id) {
                    queue[pos].filled += fill.quantity;
                    if queue[pos].remaining().is_zero() {
                        queue.remove(pos);
                        self.index.remove(&fill.maker.order_id);
                    }
                }
                if queue.is_empty() {
                    levels.remove(&level);
                }
            }
            self.last_trade_price = Some(fill.yes_price);
        }
    }

    /// Aggregate the top `depth` levels of one side. Quantity counts only
    /// the unfilled remainder of each resting order.
    pub fn aggregate(&self, side: BookSide, depth: usize) -> Vec<LevelView> {
        let levels = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        let iter: Box<dyn Iterator<Item = (&Price, &VecDeque<BookEntry>)>> = match side {
            BookSide::Bid => Box::new(levels.iter().rev()),
            BookSide::Ask => Box::new(levels.iter()),
        };
        iter.take(depth)
            .map(|(price, queue)| LevelView {
                price: price.to_decimal(),
                quantity: queue
                    .iter()
                    .map(|e| e.remaining())
                    .fold(Qty::ZERO, |acc, q| acc + q)
                    .to_decimal(),
                order_count: queue.len(),
            })
            .collect()
    }

    /// Current aggregate at a specific level; quantity 0 when the level is
    /// gone. Used to build depth deltas after a mutation.
    pub fn level_at(&self, side: BookSide, price: Price) -> LevelView {
        let levels = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        match levels.get(&price) {
            Some(queue) => LevelView {
                price: price.to_decimal(),
                quantity: queue
                    .iter()
                    .map(|e| e.remaining())
                    .fold(Qty::ZERO, |acc, q| acc + q)
                    .to_decimal(),
                order_count: queue.len(),
            },
            None => LevelView {
                price: price.to_decimal(),
                quantity: Decimal::ZERO,
                order_count: 0,
            },
        }
    }

    /// All resting entries, bids first. Used by resolution to cancel the
    /// whole book.
    pub fn entries(&self) -> Vec<BookEntry> {
        self.bids
            .values()
            .flat_map(|q| q.iter().cloned())
            .chain(self.asks.values().flat_map(|q| q.iter().cloned()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(d: Decimal) -> Price {
        Price::from_decimal(d, 1).unwrap()
    }

    fn qty(d: Decimal) -> Qty {
        Qty::from_decimal(d).unwrap()
    }

    fn entry(
        user: Uuid,
        side: OrderSide,
        outcome: Outcome,
        limit: Decimal,
        quantity: Decimal,
        at: i64,
    ) -> BookEntry {
        let limit_price = price(limit);
        let yes_price = match outcome {
            Outcome::Yes => limit_price,
            Outcome::No => limit_price.complement(),
        };
        BookEntry {
            order_id: Uuid::new_v4(),
            user_id: user,
            side,
            outcome,
            limit_price,
            yes_price,
            quantity: qty(quantity),
            filled: Qty::ZERO,
            created_at_millis: at,
        }
    }

    #[test]
    fn insert_and_remove_roundtrip() {
        let mut book = Book::new(Uuid::new_v4());
        let e = entry(Uuid::new_v4(), OrderSide::Buy, Outcome::Yes, dec!(0.40), dec!(80), 1);
        let id = e.order_id;
        book.insert(e);

        assert!(book.contains(&id));
        assert_eq!(book.best_bid(), Some(price(dec!(0.40))));

        let removed = book.remove(&id).unwrap();
        assert_eq!(removed.order_id, id);
        assert!(!book.contains(&id));
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn no_orders_land_on_the_mirrored_side() {
        let mut book = Book::new(Uuid::new_v4());
        // buy NO @ 0.65 rests as a YES ask at 0.35
        book.insert(entry(Uuid::new_v4(), OrderSide::Buy, Outcome::No, dec!(0.65), dec!(60), 1));
        assert_eq!(book.best_ask(), Some(price(dec!(0.35))));
        // sell NO @ 0.70 rests as a YES bid at 0.30
        book.insert(entry(Uuid::new_v4(), OrderSide::Sell, Outcome::No, dec!(0.70), dec!(10), 2));
        assert_eq!(book.best_bid(), Some(price(dec!(0.30))));
    }

    #[test]
    fn match_walks_price_then_time() {
        let mut book = Book::new(Uuid::new_v4());
        let maker = Uuid::new_v4();
        let a1 = entry(maker, OrderSide::Sell, Outcome::Yes, dec!(0.50), dec!(10), 1);
        let a2 = entry(maker, OrderSide::Sell, Outcome::Yes, dec!(0.45), dec!(10), 2);
        let a3 = entry(maker, OrderSide::Sell, Outcome::Yes, dec!(0.45), dec!(10), 3);
        let first_at_45 = a2.order_id;
        book.insert(a1);
        book.insert(a2);
        book.insert(a3);

        let taker = Uuid::new_v4();
        let preview = book.match_preview(taker, BookSide::Bid, Some(price(dec!(0.50))), qty(dec!(25)));

        assert_eq!(preview.fills.len(), 3);
        // best price first, FIFO within the 0.45 level
        assert_eq!(preview.fills[0].yes_price, price(dec!(0.45)));
        assert_eq!(preview.fills[0].maker.order_id, first_at_45);
        assert_eq!(preview.fills[1].yes_price, price(dec!(0.45)));
        assert_eq!(preview.fills[2].yes_price, price(dec!(0.50)));
        assert_eq!(preview.fills[2].quantity, qty(dec!(5)));
        assert!(preview.remaining.is_zero());
    }

    #[test]
    fn limit_stops_at_the_bound() {
        let mut book = Book::new(Uuid::new_v4());
        book.insert(entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.45), dec!(10), 1));
        book.insert(entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.60), dec!(10), 2));

        let preview =
            book.match_preview(Uuid::new_v4(), BookSide::Bid, Some(price(dec!(0.50))), qty(dec!(20)));
        assert_eq!(preview.fills.len(), 1);
        assert_eq!(preview.remaining, qty(dec!(10)));
    }

    #[test]
    fn market_order_sweeps_every_level() {
        let mut book = Book::new(Uuid::new_v4());
        book.insert(entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.45), dec!(10), 1));
        book.insert(entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.99), dec!(10), 2));

        let preview = book.match_preview(Uuid::new_v4(), BookSide::Bid, None, qty(dec!(30)));
        assert_eq!(preview.fills.len(), 2);
        // liquidity exhausted before the order is done
        assert_eq!(preview.remaining, qty(dec!(10)));
    }

    #[test]
    fn self_trade_is_skipped_not_matched() {
        let mut book = Book::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let own = entry(user, OrderSide::Sell, Outcome::Yes, dec!(0.60), dec!(50), 1);
        let own_id = own.order_id;
        book.insert(own);

        let preview = book.match_preview(user, BookSide::Bid, Some(price(dec!(0.65))), qty(dec!(50)));
        assert!(preview.fills.is_empty());
        assert_eq!(preview.prevented.len(), 1);
        assert_eq!(preview.prevented[0].order_id, own_id);
        assert_eq!(preview.remaining, qty(dec!(50)));
        // the skipped order is still resting
        assert!(book.contains(&own_id));
    }

    #[test]
    fn self_trade_skip_reaches_deeper_makers() {
        let mut book = Book::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        book.insert(entry(user, OrderSide::Sell, Outcome::Yes, dec!(0.50), dec!(10), 1));
        book.insert(entry(other, OrderSide::Sell, Outcome::Yes, dec!(0.55), dec!(10), 2));

        let preview = book.match_preview(user, BookSide::Bid, Some(price(dec!(0.60))), qty(dec!(10)));
        assert_eq!(preview.prevented.len(), 1);
        assert_eq!(preview.fills.len(), 1);
        assert_eq!(preview.fills[0].yes_price, price(dec!(0.55)));
    }

    #[test]
    fn apply_fills_consumes_makers() {
        let mut book = Book::new(Uuid::new_v4());
        let full = entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.45), dec!(10), 1);
        let partial = entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.50), dec!(10), 2);
        let full_id = full.order_id;
        let partial_id = partial.order_id;
        book.insert(full);
        book.insert(partial);

        let preview =
            book.match_preview(Uuid::new_v4(), BookSide::Bid, Some(price(dec!(0.50))), qty(dec!(15)));
        book.apply_fills(&preview.fills);

        assert!(!book.contains(&full_id));
        assert!(book.contains(&partial_id));
        assert_eq!(book.get(&partial_id).unwrap().remaining(), qty(dec!(5)));
        assert_eq!(book.last_trade_price(), Some(price(dec!(0.50))));
    }

    #[test]
    fn aggregate_counts_remainders() {
        let mut book = Book::new(Uuid::new_v4());
        let mut e = entry(Uuid::new_v4(), OrderSide::Buy, Outcome::Yes, dec!(0.40), dec!(80), 1);
        e.filled = qty(dec!(60));
        book.insert(e);
        book.insert(entry(Uuid::new_v4(), OrderSide::Buy, Outcome::Yes, dec!(0.40), dec!(5), 2));

        let bids = book.aggregate(BookSide::Bid, 10);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].quantity, dec!(25.0000));
        assert_eq!(bids[0].order_count, 2);
    }

    #[test]
    fn implied_probability_prefers_last_trade() {
        let mut book = Book::new(Uuid::new_v4());
        assert_eq!(book.implied_probability(), dec!(0.5));

        // one-sided book still defaults
        book.insert(entry(Uuid::new_v4(), OrderSide::Buy, Outcome::Yes, dec!(0.40), dec!(80), 1));
        assert_eq!(book.implied_probability(), dec!(0.5));

        book.insert(entry(Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, dec!(0.50), dec!(60), 2));
        book.insert(entry(Uuid::new_v4(), OrderSide::Buy, Outcome::Yes, dec!(0.44), dec!(40), 3));
        assert_eq!(book.implied_probability(), dec!(0.47));

        book.set_last_trade_price(price(dec!(0.40)));
        assert_eq!(book.implied_probability(), dec!(0.40));
    }
}
