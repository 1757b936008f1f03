//! Per-Market Matching Worker
//!
//! The single writer for one market. Commands arrive on a bounded mpsc
//! channel, which yields the per-market total order without distributed
//! locks; distinct markets run concurrently.
//!
//! A submit runs as: validate, escrow admission, non-mutating match walk,
//! one ledger transaction for every mutation, then (only after commit) the
//! in-memory book apply and event publication. A failed commit therefore
//! leaves book, escrow, and subscribers exactly as they were.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::bus::{channels, EventBus, ExchangeEvent};
use crate::metrics::names;
use crate::models::{
    Market, MarketStatus, Order, OrderEventKind, OrderIntent, OrderKind, OrderResponse, OrderSide,
    OrderStatus, Outcome, Trade, TradeView,
};
use crate::services::ledger;
use crate::services::settlement;

use super::book::{Book, BookEntry, Fill};
use super::escrow::{self, FillLeg};
use super::types::{
    book_placement, book_side_of, BookSide, BookSnapshot, CancelReason, CancellationResult,
    MatchingError, Price, Qty, ResolutionResult, SideView, SubmissionResult,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_cents: i64,
    pub min_order_quantity: Decimal,
    pub command_buffer: usize,
}

pub enum EngineCommand {
    Submit {
        intent: OrderIntent,
        reply: oneshot::Sender<Result<SubmissionResult, MatchingError>>,
    },
    Cancel {
        order_id: Uuid,
        user_id: Uuid,
        reply: oneshot::Sender<Result<CancellationResult, MatchingError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), MatchingError>>,
    },
    Resolve {
        outcome: Outcome,
        reply: oneshot::Sender<Result<ResolutionResult, MatchingError>>,
    },
    CancelMarket {
        reply: oneshot::Sender<Result<(), MatchingError>>,
    },
}

/// An event staged during the ledger transaction and published after commit.
enum Pending {
    UserOrders(Uuid, ExchangeEvent),
    MarketTrades(i64, ExchangeEvent),
}

pub struct MarketWorker {
    market_id: Uuid,
    status: MarketStatus,
    book: Arc<RwLock<Book>>,
    /// Mirror of the committed sequence for lock-free snapshot readers.
    sequence: Arc<AtomicI64>,
    seq: i64,
    pool: PgPool,
    bus: Arc<EventBus>,
    config: EngineConfig,
    rx: mpsc::Receiver<EngineCommand>,
}

impl MarketWorker {
    /// Rebuild a worker from the ledger: resting orders become book entries
    /// in (price, created_at) order and the sequence resumes where the last
    /// commit left it.
    pub fn recover(
        market: &Market,
        resting: &[Order],
        pool: PgPool,
        bus: Arc<EventBus>,
        config: EngineConfig,
        rx: mpsc::Receiver<EngineCommand>,
        book: Arc<RwLock<Book>>,
        sequence: Arc<AtomicI64>,
    ) -> Result<Self, MatchingError> {
        {
            let mut book = book.write();
            for order in resting {
                book.insert(book_entry_from_order(order, config.tick_cents)?);
            }
        }
        sequence.store(market.last_sequence, Ordering::Release);
        Ok(Self {
            market_id: market.id,
            status: market.status,
            book,
            sequence,
            seq: market.last_sequence,
            pool,
            bus,
            config,
            rx,
        })
    }

    pub async fn run(mut self) {
        tracing::info!(market_id = %self.market_id, "market writer started");
        while let Some(command) = self.rx.recv().await {
            match command {
                EngineCommand::Submit { intent, reply } => {
                    let result = self.handle_submit(intent).await;
                    if let Err(ref e) = result {
                        tracing::info!(market_id = %self.market_id, code = e.code(), "order rejected: {}", e);
                    }
                    let _ = reply.send(result);
                }
                EngineCommand::Cancel {
                    order_id,
                    user_id,
                    reply,
                } => {
                    let _ = reply.send(self.handle_cancel(order_id, user_id).await);
                }
                EngineCommand::Close { reply } => {
                    let _ = reply.send(self.handle_close().await);
                }
                EngineCommand::Resolve { outcome, reply } => {
                    let result = self.handle_resolve(outcome).await;
                    let terminal = result.is_ok();
                    let _ = reply.send(result);
                    if terminal {
                        break;
                    }
                }
                EngineCommand::CancelMarket { reply } => {
                    let result = self.handle_cancel_market().await;
                    let terminal = result.is_ok();
                    let _ = reply.send(result);
                    if terminal {
                        break;
                    }
                }
            }

            if cfg!(debug_assertions) && self.conservation_broken().await {
                break;
            }
        }
        tracing::info!(market_id = %self.market_id, "market writer stopped");
    }

    /// Fatal invariant sweep. A violation halts this writer and alarms.
    async fn conservation_broken(&self) -> bool {
        match ledger::verify_market_conservation(&self.pool, self.market_id).await {
            Ok(report) if report.is_clean() => false,
            Ok(report) => {
                for violation in &report.violations {
                    tracing::error!(
                        market_id = %self.market_id,
                        "LEDGER INVARIANT VIOLATION: {violation}"
                    );
                }
                metrics::counter!(names::INVARIANT_VIOLATIONS_TOTAL).increment(1);
                true
            }
            Err(e) => {
                tracing::warn!(market_id = %self.market_id, "conservation sweep failed: {e}");
                false
            }
        }
    }

    // ========================================================================
    // Submit
    // ========================================================================

    async fn handle_submit(
        &mut self,
        intent: OrderIntent,
    ) -> Result<SubmissionResult, MatchingError> {
        let order_id = Uuid::new_v4();

        let admitted = self.validate(&intent);
        let (limit_price, quantity) = match admitted {
            Ok(parts) => parts,
            Err(e) => {
                self.audit_rejection(order_id, &intent, &e).await;
                return Err(e);
            }
        };

        let started = std::time::Instant::now();
        let result = self
            .execute_submit(order_id, &intent, limit_price, quantity)
            .await;
        metrics::histogram!(names::ORDER_MATCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(r) => {
                metrics::counter!(names::ORDERS_SUBMITTED_TOTAL).increment(1);
                metrics::counter!(names::TRADES_EXECUTED_TOTAL).increment(r.trades.len() as u64);
            }
            // client-fault rejections are audited; transient faults are not
            Err(e) if !e.is_retriable() && !matches!(e, MatchingError::Internal(_)) => {
                self.audit_rejection(order_id, &intent, e).await;
            }
            Err(_) => {}
        }
        result
    }

    fn validate(&self, intent: &OrderIntent) -> Result<(Option<Price>, Qty), MatchingError> {
        if self.status != MarketStatus::Open {
            return Err(MatchingError::MarketNotOpen(self.market_id));
        }
        let limit_price = match (intent.kind, intent.price) {
            (OrderKind::Limit, Some(price)) => {
                Some(Price::from_decimal(price, self.config.tick_cents)?)
            }
            (OrderKind::Limit, None) => {
                return Err(MatchingError::InvalidPrice(
                    "limit order requires a price".into(),
                ))
            }
            (OrderKind::Market, _) => None,
        };
        let quantity = Qty::from_decimal(intent.quantity)?;
        if intent.quantity < self.config.min_order_quantity {
            return Err(MatchingError::InvalidQuantity(format!(
                "quantity {} below minimum {}",
                intent.quantity, self.config.min_order_quantity
            )));
        }
        Ok((limit_price, quantity))
    }

    async fn execute_submit(
        &mut self,
        order_id: Uuid,
        intent: &OrderIntent,
        limit_price: Option<Price>,
        quantity: Qty,
    ) -> Result<SubmissionResult, MatchingError> {
        let created_at = Utc::now();
        let book_side = book_side_of(intent.side, intent.outcome);
        // crossing bound in YES space; None sweeps the whole opposite side
        let yes_limit = limit_price.map(|p| book_placement(intent.side, intent.outcome, p).1);
        // buys lock cash at the limit, market buys at the 1.00 ceiling
        let escrow_price = limit_price.unwrap_or(Price::ONE);

        let preview = {
            let book = self.book.read();
            book.match_preview(intent.user_id, book_side, yes_limit, quantity)
        };

        let filled = quantity - preview.remaining;
        let final_status = taker_final_status(intent.kind, filled, preview.remaining);
        let rests = intent.kind == OrderKind::Limit && !preview.remaining.is_zero();

        let mut tx = self.pool.begin().await?;

        let mut users: Vec<Uuid> = preview.fills.iter().map(|f| f.maker.user_id).collect();
        users.push(intent.user_id);
        ledger::lock_accounts(&mut tx, &users).await?;

        // Admission: reserve the full escrow before any fill settles.
        match intent.side {
            OrderSide::Buy => {
                escrow::reserve_funds(&mut tx, intent.user_id, escrow_price.cost(quantity)).await?
            }
            OrderSide::Sell => {
                escrow::reserve_shares(
                    &mut tx,
                    intent.user_id,
                    self.market_id,
                    intent.outcome,
                    quantity,
                )
                .await?
            }
        }

        let mut seq = self.seq;
        let base_seq = seq;
        let mut pending: Vec<Pending> = Vec::new();
        let mut emitted: Vec<OrderEventKind> = Vec::new();
        let mut trade_views: Vec<TradeView> = Vec::new();

        // The order exists from the moment it is admitted.
        seq += 1;
        let order_row = Order {
            id: order_id,
            market_id: self.market_id,
            user_id: intent.user_id,
            side: intent.side,
            kind: intent.kind,
            outcome: intent.outcome,
            price: limit_price.map(|p| p.to_decimal()),
            quantity: quantity.to_decimal(),
            filled: Decimal::ZERO,
            status: OrderStatus::Pending,
            client_key: intent.client_key.clone(),
            created_at,
            updated_at: created_at,
        };
        ledger::insert_order(&mut tx, &order_row).await?;
        let created_view = OrderResponse::from(Order {
            status: if rests && filled.is_zero() {
                OrderStatus::Open
            } else {
                OrderStatus::Pending
            },
            ..order_row.clone()
        });
        ledger::append_event(
            &mut tx,
            order_id,
            self.market_id,
            intent.user_id,
            OrderEventKind::Created,
            seq,
            ExchangeEvent::OrderCreated {
                order: created_view.clone(),
            }
            .payload_value(),
        )
        .await?;
        pending.push(Pending::UserOrders(
            intent.user_id,
            ExchangeEvent::OrderCreated {
                order: created_view,
            },
        ));
        emitted.push(OrderEventKind::Created);

        // Self-trade preventions are observable skips, not matches.
        for prevented in &preview.prevented {
            seq += 1;
            let event = ExchangeEvent::SelfTradePrevented {
                market_id: self.market_id,
                order_id,
                resting_order_id: prevented.order_id,
            };
            ledger::append_event(
                &mut tx,
                order_id,
                self.market_id,
                intent.user_id,
                OrderEventKind::SelfTradePrevented,
                seq,
                event.payload_value(),
            )
            .await?;
            pending.push(Pending::UserOrders(intent.user_id, event));
            emitted.push(OrderEventKind::SelfTradePrevented);
        }

        // Settle each fill: cash legs, position legs, maker row, trade row.
        let mut taker_filled = Qty::ZERO;
        for (index, fill) in preview.fills.iter().enumerate() {
            taker_filled += fill.quantity;

            let taker_leg = FillLeg::new(
                intent.user_id,
                order_id,
                intent.side,
                intent.outcome,
                escrow_price,
                fill.yes_price,
                fill.quantity,
            );
            let maker_leg = FillLeg::new(
                fill.maker.user_id,
                fill.maker.order_id,
                fill.maker.side,
                fill.maker.outcome,
                fill.maker.limit_price,
                fill.yes_price,
                fill.quantity,
            );

            for leg in [&taker_leg, &maker_leg] {
                match leg.side {
                    OrderSide::Buy => {
                        escrow::settle_buy_leg(
                            &mut tx,
                            leg.user_id,
                            leg.locked_release(),
                            leg.available_credit(),
                        )
                        .await?
                    }
                    OrderSide::Sell => {
                        escrow::credit_available(&mut tx, leg.user_id, leg.available_credit())
                            .await?
                    }
                }
                escrow::apply_position_leg(&mut tx, self.market_id, leg).await?;
            }

            // Book-space bid party is the trade's buyer, ask party the seller.
            let (buy_order_id, buyer_id, sell_order_id, seller_id) = match book_side {
                BookSide::Bid => (
                    order_id,
                    intent.user_id,
                    fill.maker.order_id,
                    fill.maker.user_id,
                ),
                BookSide::Ask => (
                    fill.maker.order_id,
                    fill.maker.user_id,
                    order_id,
                    intent.user_id,
                ),
            };

            seq += 1;
            let trade = Trade {
                id: trade_id(self.market_id, base_seq, index),
                market_id: self.market_id,
                outcome: Outcome::Yes,
                buy_order_id,
                sell_order_id,
                buyer_id,
                seller_id,
                price: fill.yes_price.to_decimal(),
                quantity: fill.quantity.to_decimal(),
                created_at,
            };
            ledger::insert_trade(&mut tx, &trade).await?;
            let view = TradeView::from(&trade);
            ledger::append_event(
                &mut tx,
                order_id,
                self.market_id,
                intent.user_id,
                OrderEventKind::Trade,
                seq,
                ExchangeEvent::Trade { trade: view.clone() }.payload_value(),
            )
            .await?;
            pending.push(Pending::MarketTrades(
                seq,
                ExchangeEvent::Trade { trade: view.clone() },
            ));
            trade_views.push(view);
            emitted.push(OrderEventKind::Trade);

            // Maker progress: PARTIAL_FILL while resting, FILLED when done.
            let maker_filled = fill.maker.filled + fill.quantity;
            let maker_done = maker_filled == fill.maker.quantity;
            let maker_status = if maker_done {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            ledger::update_order_fill(
                &mut tx,
                fill.maker.order_id,
                maker_filled.to_decimal(),
                maker_status,
            )
            .await?;
            seq += 1;
            let maker_kind = if maker_done {
                OrderEventKind::Filled
            } else {
                OrderEventKind::PartialFill
            };
            let maker_view = maker_response(self.market_id, fill, maker_filled, maker_status);
            let maker_event = if maker_done {
                ExchangeEvent::OrderFilled { order: maker_view }
            } else {
                ExchangeEvent::OrderPartial { order: maker_view }
            };
            ledger::append_event(
                &mut tx,
                fill.maker.order_id,
                self.market_id,
                fill.maker.user_id,
                maker_kind,
                seq,
                maker_event.payload_value(),
            )
            .await?;
            pending.push(Pending::UserOrders(fill.maker.user_id, maker_event));
        }

        // Taker terminal bookkeeping.
        if !preview.remaining.is_zero() && intent.kind == OrderKind::Market {
            // A market order never rests: surplus escrow is released and the
            // remainder dies with an INSUFFICIENT_LIQUIDITY cancellation.
            match intent.side {
                OrderSide::Buy => {
                    escrow::release_funds(
                        &mut tx,
                        intent.user_id,
                        escrow_price.cost(preview.remaining),
                    )
                    .await?
                }
                OrderSide::Sell => {
                    escrow::release_shares(
                        &mut tx,
                        intent.user_id,
                        self.market_id,
                        intent.outcome,
                        preview.remaining,
                    )
                    .await?
                }
            }
        }

        ledger::update_order_fill(&mut tx, order_id, taker_filled.to_decimal(), final_status)
            .await?;
        let final_view = OrderResponse::from(Order {
            filled: taker_filled.to_decimal(),
            status: final_status,
            ..order_row.clone()
        });
        match final_status {
            OrderStatus::Filled => {
                seq += 1;
                let event = ExchangeEvent::OrderFilled {
                    order: final_view.clone(),
                };
                ledger::append_event(
                    &mut tx,
                    order_id,
                    self.market_id,
                    intent.user_id,
                    OrderEventKind::Filled,
                    seq,
                    event.payload_value(),
                )
                .await?;
                pending.push(Pending::UserOrders(intent.user_id, event));
                emitted.push(OrderEventKind::Filled);
            }
            OrderStatus::PartiallyFilled => {
                seq += 1;
                let event = ExchangeEvent::OrderPartial {
                    order: final_view.clone(),
                };
                ledger::append_event(
                    &mut tx,
                    order_id,
                    self.market_id,
                    intent.user_id,
                    OrderEventKind::PartialFill,
                    seq,
                    event.payload_value(),
                )
                .await?;
                pending.push(Pending::UserOrders(intent.user_id, event));
                emitted.push(OrderEventKind::PartialFill);
            }
            OrderStatus::Cancelled => {
                seq += 1;
                let event = ExchangeEvent::OrderCancelled {
                    order: final_view.clone(),
                    reason: CancelReason::InsufficientLiquidity,
                };
                ledger::append_event(
                    &mut tx,
                    order_id,
                    self.market_id,
                    intent.user_id,
                    OrderEventKind::Cancelled,
                    seq,
                    event.payload_value(),
                )
                .await?;
                pending.push(Pending::UserOrders(intent.user_id, event));
                emitted.push(OrderEventKind::Cancelled);
            }
            _ => {}
        }

        ledger::set_market_sequence(&mut tx, self.market_id, seq).await?;
        tx.commit().await?;

        // Commit stands; now mutate the book and tell the world.
        let mut touched: Vec<(BookSide, Price)> = preview
            .fills
            .iter()
            .map(|f| (book_side.opposite(), f.yes_price))
            .collect();
        {
            let mut book = self.book.write();
            book.apply_fills(&preview.fills);
            if rests {
                let (_, yes_price) =
                    book_placement(intent.side, intent.outcome, limit_price.expect("limit rests"));
                book.insert(BookEntry {
                    order_id,
                    user_id: intent.user_id,
                    side: intent.side,
                    outcome: intent.outcome,
                    limit_price: limit_price.expect("limit rests"),
                    yes_price,
                    quantity,
                    filled: taker_filled,
                    created_at_millis: created_at.timestamp_millis(),
                });
                touched.push((book_side, yes_price));
            }
        }
        self.seq = seq;
        self.sequence.store(seq, Ordering::Release);

        self.publish_pending(pending);
        if !touched.is_empty() {
            self.publish_book_delta(&touched);
        }
        let mut affected: Vec<Uuid> = preview.fills.iter().map(|f| f.maker.user_id).collect();
        affected.push(intent.user_id);
        self.publish_balances(&affected).await;

        Ok(SubmissionResult {
            order: final_view,
            trades: trade_views,
            events: emitted,
        })
    }

    /// S4: a rejected command leaves no order behind, only a REJECTED audit
    /// row scoped to the user. The sequence does not advance because nothing
    /// book-mutating committed.
    async fn audit_rejection(&self, order_id: Uuid, intent: &OrderIntent, error: &MatchingError) {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!("could not open audit transaction: {e}");
                return;
            }
        };
        let payload = serde_json::json!({
            "code": error.code(),
            "detail": error.to_string(),
            "side": intent.side,
            "outcome": intent.outcome,
            "quantity": intent.quantity,
            "price": intent.price,
        });
        let appended = ledger::append_event(
            &mut tx,
            order_id,
            self.market_id,
            intent.user_id,
            OrderEventKind::Rejected,
            self.seq,
            payload,
        )
        .await;
        if appended.is_ok() {
            if let Err(e) = tx.commit().await {
                tracing::warn!("rejection audit commit failed: {e}");
            }
        }
        metrics::counter!(names::ORDERS_REJECTED_TOTAL).increment(1);
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    async fn handle_cancel(
        &mut self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<CancellationResult, MatchingError> {
        let entry = {
            let book = self.book.read();
            book.get(&order_id).cloned()
        };

        let Some(entry) = entry else {
            // Not resting: terminal orders cancel idempotently, filled ones
            // reject, anything else is unknown.
            let order = ledger::fetch_order(&self.pool, order_id)
                .await?
                .ok_or(MatchingError::UnknownOrder(order_id))?;
            if order.user_id != user_id {
                return Err(MatchingError::NotOwner(order_id));
            }
            return match order.status {
                OrderStatus::Cancelled => Ok(CancellationResult {
                    order: order.into(),
                }),
                OrderStatus::Filled => Err(MatchingError::NotCancellable(order_id)),
                _ => Err(MatchingError::UnknownOrder(order_id)),
            };
        };

        if entry.user_id != user_id {
            return Err(MatchingError::NotOwner(order_id));
        }

        let remaining = entry.remaining();
        let mut tx = self.pool.begin().await?;
        ledger::lock_accounts(&mut tx, &[user_id]).await?;

        match entry.side {
            OrderSide::Buy => {
                escrow::release_funds(&mut tx, user_id, entry.limit_price.cost(remaining)).await?
            }
            OrderSide::Sell => {
                escrow::release_shares(&mut tx, user_id, self.market_id, entry.outcome, remaining)
                    .await?
            }
        }
        ledger::mark_order_status(&mut tx, order_id, OrderStatus::Cancelled).await?;

        let seq = self.seq + 1;
        let order = ledger::fetch_order_in_tx(&mut tx, order_id)
            .await?
            .ok_or(MatchingError::UnknownOrder(order_id))?;
        let view = OrderResponse::from(order);
        let event = ExchangeEvent::OrderCancelled {
            order: view.clone(),
            reason: CancelReason::UserRequested,
        };
        ledger::append_event(
            &mut tx,
            order_id,
            self.market_id,
            user_id,
            OrderEventKind::Cancelled,
            seq,
            event.payload_value(),
        )
        .await?;
        ledger::set_market_sequence(&mut tx, self.market_id, seq).await?;
        tx.commit().await?;

        let book_side = book_side_of(entry.side, entry.outcome);
        {
            let mut book = self.book.write();
            book.remove(&order_id);
        }
        self.seq = seq;
        self.sequence.store(seq, Ordering::Release);

        self.publish_pending(vec![Pending::UserOrders(user_id, event)]);
        self.publish_book_delta(&[(book_side, entry.yes_price)]);
        self.publish_balances(&[user_id]).await;
        metrics::counter!(names::ORDERS_CANCELLED_TOTAL).increment(1);

        Ok(CancellationResult { order: view })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn handle_close(&mut self) -> Result<(), MatchingError> {
        if self.status != MarketStatus::Open {
            return Err(MatchingError::MarketNotOpen(self.market_id));
        }
        let seq = self.seq + 1;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE markets SET status = 'closed', close_time = NOW(), last_sequence = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(seq)
        .bind(self.market_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.status = MarketStatus::Closed;
        self.seq = seq;
        self.sequence.store(seq, Ordering::Release);

        let event = ExchangeEvent::MarketClosed {
            market_id: self.market_id,
        };
        self.bus.publish_market(
            channels::market_book(self.market_id),
            self.market_id,
            seq,
            event.clone(),
        );
        self.bus.publish_market(
            channels::market_trades(self.market_id),
            self.market_id,
            seq,
            event,
        );
        Ok(())
    }

    async fn handle_resolve(&mut self, outcome: Outcome) -> Result<ResolutionResult, MatchingError> {
        if self.status != MarketStatus::Closed {
            return Err(MatchingError::MarketNotSettleable(self.market_id));
        }
        let entries = self.book.read().entries();
        let settled = settlement::settle_resolution(
            &self.pool,
            self.market_id,
            outcome,
            &entries,
            self.seq,
        )
        .await?;
        self.finish_terminal(settled.final_sequence, &settled.cancelled_events, &settled.affected_users)
            .await;
        self.status = MarketStatus::Resolved;

        let event = ExchangeEvent::MarketResolved {
            market_id: self.market_id,
            outcome,
        };
        self.bus.publish_market(
            channels::market_book(self.market_id),
            self.market_id,
            settled.final_sequence,
            event.clone(),
        );
        self.bus.publish_market(
            channels::market_trades(self.market_id),
            self.market_id,
            settled.final_sequence,
            event,
        );
        metrics::counter!(names::SETTLEMENTS_TOTAL).increment(1);

        Ok(ResolutionResult {
            market_id: self.market_id,
            outcome,
            orders_cancelled: settled.orders_cancelled,
            positions_settled: settled.positions_settled,
            total_payout: settled.total_payout,
        })
    }

    async fn handle_cancel_market(&mut self) -> Result<(), MatchingError> {
        if self.status.is_terminal() {
            return Err(MatchingError::MarketNotSettleable(self.market_id));
        }
        let entries = self.book.read().entries();
        let settled =
            settlement::settle_cancellation(&self.pool, self.market_id, &entries, self.seq).await?;
        self.finish_terminal(settled.final_sequence, &settled.cancelled_events, &settled.affected_users)
            .await;
        self.status = MarketStatus::Cancelled;

        let event = ExchangeEvent::MarketCancelled {
            market_id: self.market_id,
        };
        self.bus.publish_market(
            channels::market_book(self.market_id),
            self.market_id,
            settled.final_sequence,
            event.clone(),
        );
        self.bus.publish_market(
            channels::market_trades(self.market_id),
            self.market_id,
            settled.final_sequence,
            event,
        );
        Ok(())
    }

    async fn finish_terminal(
        &mut self,
        final_sequence: i64,
        cancelled: &[(Uuid, ExchangeEvent)],
        affected: &[Uuid],
    ) {
        self.book.write().clear();
        self.seq = final_sequence;
        self.sequence.store(final_sequence, Ordering::Release);
        for (user_id, event) in cancelled {
            self.bus
                .publish_user(channels::user_orders(*user_id), *user_id, event.clone());
        }
        self.publish_balances(affected).await;
    }

    // ========================================================================
    // Publication
    // ========================================================================

    fn publish_pending(&self, pending: Vec<Pending>) {
        for item in pending {
            match item {
                Pending::UserOrders(user_id, event) => {
                    self.bus
                        .publish_user(channels::user_orders(user_id), user_id, event);
                }
                Pending::MarketTrades(sequence, event) => {
                    self.bus.publish_market(
                        channels::market_trades(self.market_id),
                        self.market_id,
                        sequence,
                        event,
                    );
                }
            }
        }
    }

    fn publish_book_delta(&self, touched: &[(BookSide, Price)]) {
        let book = self.book.read();
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        let mut seen: Vec<(BookSide, Price)> = Vec::new();
        for &(side, price) in touched {
            if seen.contains(&(side, price)) {
                continue;
            }
            seen.push((side, price));
            let level = book.level_at(side, price);
            match side {
                BookSide::Bid => bids.push(level),
                BookSide::Ask => asks.push(level),
            }
        }
        drop(book);
        self.bus.publish_market(
            channels::market_book(self.market_id),
            self.market_id,
            self.seq,
            ExchangeEvent::BookDelta {
                market_id: self.market_id,
                bids,
                asks,
            },
        );
    }

    async fn publish_balances(&self, user_ids: &[Uuid]) {
        let mut seen = Vec::new();
        for &user_id in user_ids {
            if seen.contains(&user_id) {
                continue;
            }
            seen.push(user_id);
            match ledger::fetch_balance(&self.pool, user_id).await {
                Ok(Some(balance)) => {
                    self.bus.publish_user(
                        channels::user_balance(user_id),
                        user_id,
                        ExchangeEvent::BalanceUpdated {
                            balance: balance.into(),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("balance publish skipped for {user_id}: {e}"),
            }
        }
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Deterministic trade id from (commit sequence, index within the batch), so
/// a replayed prefix regenerates identical ids.
pub fn trade_id(market_id: Uuid, base_sequence: i64, index: usize) -> Uuid {
    Uuid::new_v5(
        &market_id,
        format!("{}:{}", base_sequence, index).as_bytes(),
    )
}

/// Final status of an incoming order after its matching walk.
pub fn taker_final_status(kind: OrderKind, filled: Qty, remaining: Qty) -> OrderStatus {
    if remaining.is_zero() {
        OrderStatus::Filled
    } else if kind == OrderKind::Market {
        // market orders never rest
        OrderStatus::Cancelled
    } else if filled.is_zero() {
        OrderStatus::Open
    } else {
        OrderStatus::PartiallyFilled
    }
}

/// Rehydrate a persisted resting order into its book entry.
pub fn book_entry_from_order(order: &Order, tick_cents: i64) -> Result<BookEntry, MatchingError> {
    let price = order
        .price
        .ok_or_else(|| MatchingError::InvalidPrice("resting order without price".into()))?;
    let limit_price = Price::from_decimal(price, tick_cents)?;
    let (_, yes_price) = book_placement(order.side, order.outcome, limit_price);
    Ok(BookEntry {
        order_id: order.id,
        user_id: order.user_id,
        side: order.side,
        outcome: order.outcome,
        limit_price,
        yes_price,
        quantity: Qty::from_decimal(order.quantity)?,
        filled: if order.filled.is_zero() {
            Qty::ZERO
        } else {
            Qty::from_decimal(order.filled)?
        },
        created_at_millis: order.created_at.timestamp_millis(),
    })
}

fn maker_response(market_id: Uuid, fill: &Fill, filled: Qty, status: OrderStatus) -> OrderResponse {
    OrderResponse {
        order_id: fill.maker.order_id,
        market_id,
        side: fill.maker.side,
        kind: OrderKind::Limit,
        outcome: fill.maker.outcome,
        price: Some(fill.maker.limit_price.to_decimal()),
        quantity: fill.maker.quantity.to_decimal(),
        filled: filled.to_decimal(),
        remaining: (fill.maker.quantity - filled).to_decimal(),
        status,
        created_at: chrono::DateTime::from_timestamp_millis(fill.maker.created_at_millis)
            .unwrap_or_else(Utc::now),
    }
}

/// Build a read-only snapshot from the shared book state. The NO view is the
/// YES view reflected through `1 - p`: demand for NO is supply of YES.
pub fn snapshot_from_book(book: &Book, depth: usize, sequence: i64) -> BookSnapshot {
    let yes_bids = book.aggregate(BookSide::Bid, depth);
    let yes_asks = book.aggregate(BookSide::Ask, depth);
    let mirror = |levels: &[super::types::LevelView]| {
        levels
            .iter()
            .map(|l| super::types::LevelView {
                price: Decimal::ONE - l.price,
                quantity: l.quantity,
                order_count: l.order_count,
            })
            .collect::<Vec<_>>()
    };
    BookSnapshot {
        market_id: book.market_id(),
        no: SideView {
            bids: mirror(&yes_asks),
            asks: mirror(&yes_bids),
        },
        implied_probability: book.implied_probability(),
        yes: SideView {
            bids: yes_bids,
            asks: yes_asks,
        },
        sequence,
        timestamp: Utc::now().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::types::Money;
    use rust_decimal_macros::dec;

    fn price(d: Decimal) -> Price {
        Price::from_decimal(d, 1).unwrap()
    }

    fn qty(d: Decimal) -> Qty {
        Qty::from_decimal(d).unwrap()
    }

    #[test]
    fn trade_ids_are_deterministic() {
        let market = Uuid::new_v4();
        assert_eq!(trade_id(market, 41, 0), trade_id(market, 41, 0));
        assert_ne!(trade_id(market, 41, 0), trade_id(market, 41, 1));
        assert_ne!(trade_id(market, 41, 0), trade_id(market, 42, 0));
        assert_ne!(trade_id(market, 41, 0), trade_id(Uuid::new_v4(), 41, 0));
    }

    #[test]
    fn taker_status_covers_every_ending() {
        assert_eq!(
            taker_final_status(OrderKind::Limit, qty(dec!(10)), Qty::ZERO),
            OrderStatus::Filled
        );
        assert_eq!(
            taker_final_status(OrderKind::Limit, Qty::ZERO, qty(dec!(10))),
            OrderStatus::Open
        );
        assert_eq!(
            taker_final_status(OrderKind::Limit, qty(dec!(4)), qty(dec!(6))),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(
            taker_final_status(OrderKind::Market, qty(dec!(4)), qty(dec!(6))),
            OrderStatus::Cancelled
        );
        assert_eq!(
            taker_final_status(OrderKind::Market, Qty::ZERO, qty(dec!(10))),
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn recovered_no_order_lands_on_the_mirrored_level() {
        let order = Order {
            id: Uuid::new_v4(),
            market_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            outcome: Outcome::No,
            price: Some(dec!(0.65)),
            quantity: dec!(60),
            filled: dec!(10),
            status: OrderStatus::PartiallyFilled,
            client_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let entry = book_entry_from_order(&order, 1).unwrap();
        assert_eq!(entry.limit_price, price(dec!(0.65)));
        assert_eq!(entry.yes_price, price(dec!(0.35)));
        assert_eq!(entry.remaining(), qty(dec!(50)));
    }

    #[test]
    fn snapshot_mirrors_no_side_through_complement() {
        let mut book = Book::new(Uuid::new_v4());
        book.insert(
            book_entry_from_order(
                &Order {
                    id: Uuid::new_v4(),
                    market_id: book.market_id(),
                    user_id: Uuid::new_v4(),
                    side: OrderSide::Buy,
                    kind: OrderKind::Limit,
                    outcome: Outcome::Yes,
                    price: Some(dec!(0.40)),
                    quantity: dec!(80),
                    filled: dec!(0),
                    status: OrderStatus::Open,
                    client_key: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                1,
            )
            .unwrap(),
        );

        let snapshot = snapshot_from_book(&book, 10, 3);
        assert_eq!(snapshot.yes.bids.len(), 1);
        assert_eq!(snapshot.yes.bids[0].price, dec!(0.40));
        // a YES bid at 0.40 is supply of NO at 0.60
        assert_eq!(snapshot.no.asks[0].price, dec!(0.60));
        assert_eq!(snapshot.no.asks[0].quantity, dec!(80.0000));
        assert!(snapshot.no.bids.is_empty());
        assert_eq!(snapshot.sequence, 3);
    }

    // S1 at the planning layer: the full escrow/settlement arithmetic for
    // the crossing NO buy, without a ledger.
    #[test]
    fn scenario_one_numbers_hold() {
        let market = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut book = Book::new(market);

        // A: BUY YES @ 0.40 x 80, escrow $32, rests
        let a_escrow = price(dec!(0.40)).cost(qty(dec!(80)));
        assert_eq!(a_escrow.to_decimal(), dec!(32.000000));
        let a_order = Uuid::new_v4();
        book.insert(BookEntry {
            order_id: a_order,
            user_id: alice,
            side: OrderSide::Buy,
            outcome: Outcome::Yes,
            limit_price: price(dec!(0.40)),
            yes_price: price(dec!(0.40)),
            quantity: qty(dec!(80)),
            filled: Qty::ZERO,
            created_at_millis: 1,
        });

        // B: BUY NO @ 0.65 x 60 arrives as an ask-side taker at YES 0.35
        let (b_side, b_yes_limit) =
            book_placement(OrderSide::Buy, Outcome::No, price(dec!(0.65)));
        assert_eq!(b_side, BookSide::Ask);
        let preview = book.match_preview(bob, b_side, Some(b_yes_limit), qty(dec!(60)));

        // crosses A's bid at the maker price 0.40 for the full 60
        assert_eq!(preview.fills.len(), 1);
        let fill = &preview.fills[0];
        assert_eq!(fill.yes_price, price(dec!(0.40)));
        assert_eq!(fill.quantity, qty(dec!(60)));
        assert!(preview.remaining.is_zero());

        // A's maker leg: pays 0.40 x 60 = $24 from locked, no refund
        let a_leg = FillLeg::new(
            alice,
            a_order,
            OrderSide::Buy,
            Outcome::Yes,
            price(dec!(0.40)),
            fill.yes_price,
            fill.quantity,
        );
        assert_eq!(a_leg.locked_release().to_decimal(), dec!(24.000000));
        assert_eq!(a_leg.available_credit(), Money::ZERO);

        // B's taker leg: locked $39, pays NO price 0.60, $3 improvement back
        let b_leg = FillLeg::new(
            bob,
            Uuid::new_v4(),
            OrderSide::Buy,
            Outcome::No,
            price(dec!(0.65)),
            fill.yes_price,
            fill.quantity,
        );
        assert_eq!(b_leg.own_price, price(dec!(0.60)));
        assert_eq!(b_leg.net_cash().to_decimal(), dec!(-36.000000));

        // the pair mints: cash entering the float covers the $1 payout
        assert_eq!(
            (a_leg.net_cash() + b_leg.net_cash()).to_decimal(),
            dec!(-60.000000)
        );

        // A's remaining 20 still rests at 0.40 with $8 locked
        book.apply_fills(&preview.fills);
        let rest = book.get(&a_order).unwrap();
        assert_eq!(rest.remaining(), qty(dec!(20)));
        assert_eq!(
            rest.limit_price.cost(rest.remaining()).to_decimal(),
            dec!(8.000000)
        );
        assert_eq!(book.last_trade_price(), Some(price(dec!(0.40))));
    }

    // S6: an incoming buy never crosses the same user's resting ask; both
    // escrows stand at once.
    #[test]
    fn scenario_six_dual_escrow() {
        let market = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let mut book = Book::new(market);

        // resting SELL YES @ 0.60 x 50: 50 shares committed
        let ask_id = Uuid::new_v4();
        book.insert(BookEntry {
            order_id: ask_id,
            user_id: alice,
            side: OrderSide::Sell,
            outcome: Outcome::Yes,
            limit_price: price(dec!(0.60)),
            yes_price: price(dec!(0.60)),
            quantity: qty(dec!(50)),
            filled: Qty::ZERO,
            created_at_millis: 1,
        });

        // incoming BUY YES @ 0.65 x 50 would cross, but it is Alice's own ask
        let preview =
            book.match_preview(alice, BookSide::Bid, Some(price(dec!(0.65))), qty(dec!(50)));
        assert!(preview.fills.is_empty());
        assert_eq!(preview.prevented.len(), 1);
        assert_eq!(preview.prevented[0].order_id, ask_id);

        // the buy rests with its full cash escrow alongside the share escrow
        assert_eq!(
            taker_final_status(OrderKind::Limit, Qty::ZERO, preview.remaining),
            OrderStatus::Open
        );
        assert_eq!(
            price(dec!(0.65)).cost(preview.remaining).to_decimal(),
            dec!(32.500000)
        );
        assert!(book.contains(&ask_id));
    }
}
