//! Trade executor: quote, execute and persist under lock and idempotency claim
//!
//! This is the only component that mutates balances and positions as the
//! result of a trade. Every mutation lands in one durable batch; caches,
//! events and the historical record follow only after that batch commits.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AgentConfig, AgentRegistry, EngineConfig};
use crate::coord::{keys, DistributedLock, IdempotencyGuard};
use crate::engine::dispatch::{Job, WorkDispatcher};
use crate::engine::events::{PositionEvent, PositionEventBus};
use crate::error::{with_timeout, EngineError, EngineResult, ErrorCode};
use crate::state::{
    BalanceLedger, CloseReason, CommitReceipt, DurableStore, HistoricalSwap, Position,
    PositionStore, TradeKind, TradeRecord, WriteOp,
};
use crate::triggers::{initial_state, DcaDecision, TakeProfitDecision};
use crate::types::{
    from_smallest_units, is_valid_address, to_smallest_units, TokenAddress, SOL_DECIMALS, SOL_MINT,
};
use crate::venue::{parse_swap_fees, Quote, QuoteRequest, SwapExecution, SwapFees, SwapVenue, TokenMetadata};

/// Fractions of the requested size tried when price impact is too high
const SIZE_LADDER: [Decimal; 4] = [dec!(1.0), dec!(0.9), dec!(0.8), dec!(0.7)];

/// A new purchase request
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub agent_id: String,
    pub token: TokenAddress,
    pub token_symbol: String,
    pub amount_sol: Decimal,
}

/// What a trade did
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub trade: TradeRecord,
    /// Position after the trade; `None` when it was closed (or never tracked)
    pub position: Option<Position>,
    pub closed: bool,
    /// P&L booked by this trade, when it sold anything
    pub realized_pnl_sol: Option<Decimal>,
}

/// A swap fill converted to decimal amounts
#[derive(Debug, Clone)]
struct Fill {
    execution: SwapExecution,
    fees: SwapFees,
    simulated: bool,
}

impl Fill {
    /// Input consumed, in smallest units
    fn input_units(&self) -> u64 {
        self.execution
            .total_input_amount
            .unwrap_or(self.execution.input_amount)
    }

    /// SOL debited for a buy, fees included
    fn sol_spent(&self) -> Decimal {
        let input = from_smallest_units(self.input_units(), SOL_DECIMALS);
        match self.execution.total_input_amount {
            Some(_) => input + self.fees.network_fee_sol,
            None => input + self.fees.total(),
        }
    }

    /// Tokens credited for a buy
    fn tokens_received(&self, decimals: u32) -> Decimal {
        let units = self
            .execution
            .total_output_amount
            .unwrap_or(self.execution.output_amount);
        from_smallest_units(units, decimals)
    }

    /// Tokens debited for a sell
    fn tokens_sold(&self, decimals: u32) -> Decimal {
        from_smallest_units(self.input_units(), decimals)
    }

    /// SOL credited for a sell, net of fees
    fn net_sol_received(&self) -> Decimal {
        match self.execution.total_output_amount {
            Some(net) => from_smallest_units(net, SOL_DECIMALS) - self.fees.network_fee_sol,
            None => {
                from_smallest_units(self.execution.output_amount, SOL_DECIMALS) - self.fees.total()
            }
        }
    }
}

fn price_of(sol: Decimal, tokens: Decimal) -> Decimal {
    if tokens > Decimal::ZERO {
        sol / tokens
    } else {
        Decimal::ZERO
    }
}

fn sol_token() -> TokenAddress {
    TokenAddress::new(SOL_MINT)
}

/// Orchestrates purchase, sale, take-profit, DCA and write-off trades
pub struct TradeExecutor {
    config: EngineConfig,
    agents: Arc<AgentRegistry>,
    store: Arc<dyn DurableStore>,
    positions: Arc<PositionStore>,
    ledger: Arc<BalanceLedger>,
    lock: DistributedLock,
    guard: IdempotencyGuard,
    swap: Arc<dyn SwapVenue>,
    metadata: Arc<dyn TokenMetadata>,
    events: PositionEventBus,
    dispatcher: Arc<dyn WorkDispatcher>,
}

impl TradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        agents: Arc<AgentRegistry>,
        store: Arc<dyn DurableStore>,
        positions: Arc<PositionStore>,
        ledger: Arc<BalanceLedger>,
        lock: DistributedLock,
        guard: IdempotencyGuard,
        swap: Arc<dyn SwapVenue>,
        metadata: Arc<dyn TokenMetadata>,
        events: PositionEventBus,
        dispatcher: Arc<dyn WorkDispatcher>,
    ) -> Self {
        Self {
            config,
            agents,
            store,
            positions,
            ledger,
            lock,
            guard,
            swap,
            metadata,
            events,
            dispatcher,
        }
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Buy a token and open a tracked position when SL or TP is enabled
    pub async fn execute_purchase(&self, request: PurchaseRequest) -> EngineResult<TradeOutcome> {
        let agent = self.agent(&request.agent_id)?;

        if request.token.is_sol() || !is_valid_address(request.token.original()) {
            return Err(EngineError::Validation(format!(
                "cannot buy token '{}'",
                request.token
            )));
        }
        if request.amount_sol < self.config.min_trade_sol {
            return Err(EngineError::Validation(format!(
                "purchase of {} SOL is below the minimum of {} SOL",
                request.amount_sol, self.config.min_trade_sol
            )));
        }
        if agent.tracks_positions() {
            let existing = self
                .positions
                .find_open(&agent.agent_id, &agent.wallet_address, request.token.key())
                .await?;
            if let Some(existing) = existing {
                return Err(EngineError::Validation(format!(
                    "position {} already open for {}; scale in with DCA instead",
                    existing.id, request.token
                )));
            }
        }

        let key = keys::purchase(&agent.agent_id, &agent.wallet_address, request.token.key());
        self.guard
            .with_claim(&key, || self.purchase_inner(&agent, &request))
            .await
    }

    /// Close the whole position
    pub async fn execute_sale(&self, position_id: Uuid, reason: CloseReason) -> EngineResult<TradeOutcome> {
        self.lock
            .with_position_lock(position_id, || async {
                self.guard
                    .with_claim(&keys::sale(position_id), || self.sale_inner(position_id, reason))
                    .await
            })
            .await
    }

    /// Sell the levels crossed by a take-profit decision
    pub async fn execute_take_profit_sale(
        &self,
        position_id: Uuid,
        decision: &TakeProfitDecision,
    ) -> EngineResult<TradeOutcome> {
        let first_level = decision
            .levels_to_execute
            .first()
            .copied()
            .ok_or_else(|| EngineError::Validation("take-profit decision without levels".to_string()))?;
        let key = keys::take_profit(position_id, first_level, decision.levels_to_execute.len());

        self.lock
            .with_position_lock(position_id, || async {
                self.guard
                    .with_claim(&key, || self.take_profit_inner(position_id, decision, &key))
                    .await
            })
            .await
    }

    /// Scale into a losing position
    pub async fn execute_dca_buy(&self, position_id: Uuid, decision: &DcaDecision) -> EngineResult<TradeOutcome> {
        let key = keys::dca(position_id, decision.dca_count, decision.drop_percent);

        let result = self
            .lock
            .with_position_lock(position_id, || async {
                self.guard
                    .with_claim(&key, || self.dca_inner(position_id, decision, &key))
                    .await
            })
            .await;

        if let Err(e) = &result {
            if e.code() == ErrorCode::InsufficientBalance {
                // Stop retrying every tick until funds may have arrived
                let suspend = keys::dca_suspend(position_id);
                if let Err(kv) = self
                    .guard
                    .check_and_set(&suspend, Some(self.config.dca_suspend_window))
                    .await
                {
                    warn!("Failed to set DCA suspend window for {}: {}", position_id, kv);
                }
            }
        }
        result
    }

    /// Close a position without a swap when its market has collapsed
    pub async fn execute_write_off(&self, position_id: Uuid, reason: CloseReason) -> EngineResult<TradeOutcome> {
        self.lock
            .with_position_lock(position_id, || async {
                self.guard
                    .with_claim(&keys::write_off(position_id), || {
                        self.write_off_inner(position_id, reason)
                    })
                    .await
            })
            .await
    }

    // ---------------------------------------------------------------------
    // Critical sections
    // ---------------------------------------------------------------------

    async fn purchase_inner(&self, agent: &AgentConfig, request: &PurchaseRequest) -> EngineResult<TradeOutcome> {
        let sol = sol_token();
        self.ledger
            .ensure_sufficient(&agent.wallet_address, sol.key(), "SOL", request.amount_sol)
            .await?;

        let decimals = self.decimals(request.token.original()).await?;
        let (quote, _) = self
            .quote_with_ladder(
                SOL_MINT,
                request.token.original(),
                request.amount_sol,
                SOL_DECIMALS,
                &agent.wallet_address,
            )
            .await?;
        let fill = self.fill(agent, &quote).await?;

        let sol_spent = fill.sol_spent();
        let tokens = fill.tokens_received(decimals);
        if tokens <= Decimal::ZERO {
            return Err(EngineError::execution(
                "purchase",
                anyhow::anyhow!("swap returned no tokens for {}", request.token),
            ));
        }
        let price = price_of(sol_spent, tokens);

        let mut position = None;
        if agent.tracks_positions() {
            let mut opened = Position::new(
                &agent.agent_id,
                &agent.wallet_address,
                &request.token,
                &request.token_symbol,
                tokens,
                sol_spent,
                fill.execution.transaction_hash.clone(),
            );
            if agent.stop_loss.enabled {
                let (peak, pct) = initial_state(opened.purchase_price, &agent.stop_loss);
                opened.peak_price = Some(peak);
                opened.current_stop_loss_percentage = Some(pct);
                opened.last_stop_loss_update = Some(opened.created_at);
            }
            position = Some(opened);
        }

        let trade = self.trade_record(
            agent,
            position.as_ref().map(|p| p.id),
            TradeKind::Buy,
            None,
            (SOL_MINT, sol_spent),
            (request.token.original(), tokens),
            price,
            &fill,
        );

        let mut ops = vec![
            WriteOp::InsertTrade(trade.clone()),
            BalanceLedger::delta(&agent.wallet_address, sol.key(), "SOL", -sol_spent),
            BalanceLedger::delta(
                &agent.wallet_address,
                request.token.key(),
                &request.token_symbol,
                tokens,
            ),
        ];
        if let Some(position) = &position {
            ops.push(WriteOp::InsertPosition(position.clone()));
        }

        let receipt = self.commit(ops).await?;
        self.refresh_caches(&receipt).await;

        info!(
            "🟢 BUY {} {} for {} SOL @ {} ({}{})",
            tokens,
            request.token_symbol,
            sol_spent,
            price,
            agent.agent_id,
            if fill.simulated { ", simulated" } else { "" }
        );
        if let Some(position) = &position {
            self.events.publish(PositionEvent::Created(position.clone()));
        }

        Ok(TradeOutcome {
            trade,
            position,
            closed: false,
            realized_pnl_sol: None,
        })
    }

    async fn sale_inner(&self, position_id: Uuid, reason: CloseReason) -> EngineResult<TradeOutcome> {
        let position = self.load_position(position_id).await?;
        let agent = self.agent(&position.agent_id)?;

        if position.is_dust() {
            return self.close_without_swap(&agent, position, reason, TradeKind::Sell).await;
        }

        let token = position.token();
        self.ledger
            .ensure_sufficient(
                &position.wallet_address,
                token.key(),
                &position.token_symbol,
                position.remaining_amount,
            )
            .await?;

        let decimals = self.decimals(token.original()).await?;
        let (quote, _) = self
            .quote_with_ladder(
                token.original(),
                SOL_MINT,
                position.remaining_amount,
                decimals,
                &position.wallet_address,
            )
            .await?;
        let fill = self.fill(&agent, &quote).await?;

        let tokens_sold = fill.tokens_sold(decimals).min(position.remaining_amount);
        let net_sol = fill.net_sol_received();

        self.book_sale(&agent, position, tokens_sold, net_sol, &fill, reason, TradeKind::Sell, None)
            .await
    }

    async fn take_profit_inner(
        &self,
        position_id: Uuid,
        decision: &TakeProfitDecision,
        key: &str,
    ) -> EngineResult<TradeOutcome> {
        let position = self.load_position(position_id).await?;
        let expected_hit = decision.levels_to_execute.first().copied().unwrap_or_default();
        if position.take_profit_levels_hit != expected_hit {
            // Same levels already sold by an earlier attempt
            return Err(EngineError::AlreadyInProgress(key.to_string()));
        }
        let agent = self.agent(&position.agent_id)?;

        let sell_amount = decision.sell_amount.min(position.remaining_amount);
        if sell_amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "nothing left to sell on position {}",
                position.id
            )));
        }

        let token = position.token();
        self.ledger
            .ensure_sufficient(&position.wallet_address, token.key(), &position.token_symbol, sell_amount)
            .await?;

        let decimals = self.decimals(token.original()).await?;
        let (quote, _) = self
            .quote_with_ladder(token.original(), SOL_MINT, sell_amount, decimals, &position.wallet_address)
            .await?;
        let fill = self.fill(&agent, &quote).await?;

        let tokens_sold = fill.tokens_sold(decimals).min(position.remaining_amount);
        let net_sol = fill.net_sol_received();

        self.book_sale(
            &agent,
            position,
            tokens_sold,
            net_sol,
            &fill,
            CloseReason::TakeProfit,
            TradeKind::TakeProfitSell,
            Some(decision),
        )
        .await
    }

    async fn dca_inner(&self, position_id: Uuid, decision: &DcaDecision, key: &str) -> EngineResult<TradeOutcome> {
        let original = self.load_position(position_id).await?;
        if original.dca_count != decision.dca_count {
            return Err(EngineError::AlreadyInProgress(key.to_string()));
        }
        let agent = self.agent(&original.agent_id)?;
        let sol = sol_token();

        self.ledger
            .ensure_sufficient(&original.wallet_address, sol.key(), "SOL", decision.buy_amount_sol)
            .await?;

        let token = original.token();
        let decimals = self.decimals(token.original()).await?;
        let (quote, _) = self
            .quote_with_ladder(
                SOL_MINT,
                token.original(),
                decision.buy_amount_sol,
                SOL_DECIMALS,
                &original.wallet_address,
            )
            .await?;
        let fill = self.fill(&agent, &quote).await?;

        let sol_spent = fill.sol_spent();
        let tokens = fill.tokens_received(decimals);
        if tokens <= Decimal::ZERO {
            return Err(EngineError::execution(
                "dca buy",
                anyhow::anyhow!("swap returned no tokens for position {}", position_id),
            ));
        }
        let price = price_of(sol_spent, tokens);
        let now = Utc::now();

        let mut position = original.clone();
        position.apply_dca_fill(tokens, sol_spent, fill.execution.transaction_hash.clone(), now);
        position.dca_levels_consumed = position
            .dca_levels_consumed
            .max(decision.trigger_level as u32 + 1);
        position.lowest_price = Some(position.lowest_price.map_or(price, |low| low.min(price)));
        if position.take_profit_levels_hit > 0 && agent.take_profit.enabled {
            // Re-arm the ladder against the new average entry
            position.tp_batch_start_level = position.take_profit_levels_hit;
            position.total_take_profit_levels =
                position.take_profit_levels_hit + agent.take_profit.levels.len() as u32;
        }

        let trade = self.trade_record(
            &agent,
            Some(position.id),
            TradeKind::DcaBuy,
            None,
            (SOL_MINT, sol_spent),
            (token.original(), tokens),
            price,
            &fill,
        );

        let receipt = self
            .commit(vec![
                WriteOp::InsertTrade(trade.clone()),
                BalanceLedger::delta(&position.wallet_address, sol.key(), "SOL", -sol_spent),
                BalanceLedger::delta(&position.wallet_address, token.key(), &position.token_symbol, tokens),
                WriteOp::UpdatePosition {
                    position: position.clone(),
                    expected_updated_at: original.updated_at,
                },
            ])
            .await?;
        self.refresh_caches(&receipt).await;

        info!(
            "🔵 DCA #{} {} +{} tokens for {} SOL, avg {} -> {}",
            position.dca_count, position.token_symbol, tokens, sol_spent, original.purchase_price, position.purchase_price
        );
        self.events.publish(PositionEvent::Updated(position.clone()));

        Ok(TradeOutcome {
            trade,
            position: Some(position),
            closed: false,
            realized_pnl_sol: None,
        })
    }

    async fn write_off_inner(&self, position_id: Uuid, reason: CloseReason) -> EngineResult<TradeOutcome> {
        let position = self.load_position(position_id).await?;
        let agent = self.agent(&position.agent_id)?;
        self.close_without_swap(&agent, position, reason, TradeKind::WriteOff).await
    }

    // ---------------------------------------------------------------------
    // Booking
    // ---------------------------------------------------------------------

    /// Persist a sale: full close when nothing meaningful remains, otherwise a
    /// partial close that keeps the position open
    #[allow(clippy::too_many_arguments)]
    async fn book_sale(
        &self,
        agent: &AgentConfig,
        original: Position,
        tokens_sold: Decimal,
        net_sol: Decimal,
        fill: &Fill,
        reason: CloseReason,
        kind: TradeKind,
        take_profit: Option<&TakeProfitDecision>,
    ) -> EngineResult<TradeOutcome> {
        let token = original.token();
        let sol = sol_token();
        let now = Utc::now();
        let price = price_of(net_sol, tokens_sold);

        let mut updated = original.clone();
        if let Some(decision) = take_profit {
            updated.take_profit_levels_hit = decision.levels_hit_after();
            updated.tp_batch_start_level = decision.tp_batch_start_level;
            updated.total_take_profit_levels = decision.total_take_profit_levels;
            updated
                .take_profit_transaction_ids
                .push(fill.execution.transaction_hash.clone());
        }

        let leftover = original.remaining_amount - tokens_sold;
        let keeps_moon_bag = take_profit.map(|d| d.activate_moon_bag).unwrap_or(false);
        let full_close = crate::state::is_dust(leftover) && !keeps_moon_bag;

        let trade = self.trade_record(
            agent,
            Some(original.id),
            kind,
            Some(reason),
            (token.original(), tokens_sold),
            (SOL_MINT, net_sol),
            price,
            fill,
        );
        let mut ops = vec![
            WriteOp::InsertTrade(trade.clone()),
            BalanceLedger::delta(&original.wallet_address, token.key(), &original.token_symbol, -tokens_sold),
            BalanceLedger::delta(&original.wallet_address, sol.key(), "SOL", net_sol),
        ];

        if full_close {
            let realized = updated.close_profit(net_sol);
            let record = HistoricalSwap::from_close(&updated, tokens_sold, net_sol, reason, now);
            ops.push(WriteOp::DeletePosition(original.id));

            let receipt = self.commit(ops).await?;
            self.refresh_caches(&receipt).await;

            info!(
                "🔴 CLOSED {} ({}) sold {} for {} SOL, P&L {} SOL",
                original.token_symbol, reason, tokens_sold, net_sol, realized
            );
            self.events.publish(PositionEvent::Closed {
                position: updated,
                reason,
            });
            self.record_history(record).await;

            return Ok(TradeOutcome {
                trade,
                position: None,
                closed: true,
                realized_pnl_sol: Some(realized),
            });
        }

        let realized = updated.apply_partial_sale(tokens_sold, net_sol, now);
        if keeps_moon_bag {
            updated.moon_bag_activated = true;
            updated.moon_bag_amount = Some(updated.remaining_amount);
        }
        ops.push(WriteOp::UpdatePosition {
            position: updated.clone(),
            expected_updated_at: original.updated_at,
        });

        let receipt = self.commit(ops).await?;
        self.refresh_caches(&receipt).await;

        info!(
            "🟡 PARTIAL {} ({}) sold {} for {} SOL, realized {} SOL, {} left{}",
            updated.token_symbol,
            reason,
            tokens_sold,
            net_sol,
            realized,
            updated.remaining_amount,
            if updated.moon_bag_activated { " (moon bag)" } else { "" }
        );
        self.events.publish(PositionEvent::Updated(updated.clone()));

        Ok(TradeOutcome {
            trade,
            position: Some(updated),
            closed: false,
            realized_pnl_sol: Some(realized),
        })
    }

    /// Close a position with nothing to sell into: dust leftovers, or a write-off
    async fn close_without_swap(
        &self,
        agent: &AgentConfig,
        position: Position,
        reason: CloseReason,
        kind: TradeKind,
    ) -> EngineResult<TradeOutcome> {
        let token = position.token();
        let held = self
            .ledger
            .get_balance(&position.wallet_address, token.key())
            .await?;
        let now = Utc::now();
        let realized = position.close_profit(Decimal::ZERO);
        let record = HistoricalSwap::from_close(&position, position.remaining_amount, Decimal::ZERO, reason, now);

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            agent_id: agent.agent_id.clone(),
            wallet_address: position.wallet_address.clone(),
            position_id: Some(position.id),
            kind,
            reason: Some(reason),
            input_mint: token.original().to_string(),
            output_mint: SOL_MINT.to_string(),
            input_amount: position.remaining_amount,
            output_amount: Decimal::ZERO,
            price: Decimal::ZERO,
            protocol_fee_sol: Decimal::ZERO,
            network_fee_sol: Decimal::ZERO,
            price_impact_pct: Decimal::ZERO,
            transaction_hash: format!("writeoff_{}", position.id.simple()),
            simulated: agent.simulation,
            created_at: now,
        };

        let mut ops = vec![WriteOp::InsertTrade(trade.clone())];
        if held > Decimal::ZERO {
            ops.push(BalanceLedger::delta(
                &position.wallet_address,
                token.key(),
                &position.token_symbol,
                -held,
            ));
        }
        ops.push(WriteOp::DeletePosition(position.id));

        let receipt = self.commit(ops).await?;
        self.refresh_caches(&receipt).await;

        warn!(
            "⚫ WROTE OFF {} ({}) {} tokens, P&L {} SOL",
            position.token_symbol, reason, position.remaining_amount, realized
        );
        self.events.publish(PositionEvent::Closed {
            position,
            reason,
        });
        self.record_history(record).await;

        Ok(TradeOutcome {
            trade,
            position: None,
            closed: true,
            realized_pnl_sol: Some(realized),
        })
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn agent(&self, agent_id: &str) -> EngineResult<Arc<AgentConfig>> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown agent '{}'", agent_id)))
    }

    async fn load_position(&self, position_id: Uuid) -> EngineResult<Position> {
        self.positions
            .load_fresh(position_id)
            .await?
            .ok_or(EngineError::PositionNotFound(position_id))
    }

    async fn decimals(&self, mint: &str) -> EngineResult<u32> {
        with_timeout(
            "token metadata",
            self.config.metadata_timeout,
            self.metadata.get_token_decimals(mint),
        )
        .await
    }

    /// Quote at full size, then at reduced sizes while price impact is too high.
    /// Buys must clear the minimum viable size at every rung; sells may
    /// always try their full size, so a position that lost its value can
    /// still be exited.
    async fn quote_with_ladder(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: Decimal,
        input_decimals: u32,
        wallet_address: &str,
    ) -> EngineResult<(Quote, Decimal)> {
        let max = self.config.max_price_impact_pct;
        let mut last_impact = Decimal::ZERO;

        for (attempt, factor) in SIZE_LADDER.iter().enumerate() {
            let size = amount * *factor;
            let units = to_smallest_units(size, input_decimals)
                .filter(|units| *units > 0)
                .ok_or_else(|| EngineError::Validation(format!("trade size {} is not representable", size)))?;

            let request = QuoteRequest {
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                amount: units,
                wallet_address: Some(wallet_address.to_string()),
                slippage_bps: self.config.slippage_bps,
            };
            let quote = with_timeout("quote", self.config.quote_timeout, self.swap.get_quote(&request)).await?;

            let sol_side = if input_mint == SOL_MINT {
                size
            } else {
                from_smallest_units(quote.out_amount, SOL_DECIMALS)
            };
            if sol_side < self.config.min_trade_sol {
                if attempt > 0 {
                    debug!("Reduced size {} fell below the minimum viable trade", size);
                    break;
                }
                if input_mint == SOL_MINT {
                    return Err(EngineError::Validation(format!(
                        "trade worth {} SOL is below the minimum of {} SOL",
                        sol_side, self.config.min_trade_sol
                    )));
                }
                debug!("Selling {} worth only {} SOL", size, sol_side);
            }

            if quote.price_impact_pct <= max {
                if attempt > 0 {
                    info!("📉 Reduced trade to {}x ({}) for price impact {}%", factor, size, quote.price_impact_pct);
                }
                return Ok((quote, size));
            }

            debug!("Price impact {}% > {}% at {}x, retrying smaller", quote.price_impact_pct, max, factor);
            last_impact = quote.price_impact_pct;
        }

        Err(EngineError::PriceImpactTooHigh {
            impact: last_impact,
            max,
        })
    }

    /// Execute on the venue, or synthesize a fill from the quote in simulation
    async fn fill(&self, agent: &AgentConfig, quote: &Quote) -> EngineResult<Fill> {
        let execution = if agent.simulation {
            let mut payload = quote.payload.clone();
            let network_fee = to_smallest_units(self.config.simulated_network_fee_sol, SOL_DECIMALS).unwrap_or(0);
            if let serde_json::Value::Object(map) = &mut payload {
                map.insert("networkFeeLamports".to_string(), network_fee.into());
            } else {
                payload = serde_json::json!({ "networkFeeLamports": network_fee });
            }
            SwapExecution {
                input_amount: quote.in_amount,
                output_amount: quote.out_amount,
                total_input_amount: None,
                total_output_amount: None,
                transaction_hash: format!("sim_{}", Uuid::new_v4().simple()),
                slippage_bps: Some(0),
                price_impact_pct: quote.price_impact_pct,
                swap_payload: payload,
            }
        } else {
            with_timeout(
                "swap execution",
                self.config.execute_timeout,
                self.swap.execute_swap(quote, &agent.wallet_address),
            )
            .await?
        };

        let fees = parse_swap_fees(&execution.swap_payload);
        Ok(Fill {
            execution,
            fees,
            simulated: agent.simulation,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn trade_record(
        &self,
        agent: &AgentConfig,
        position_id: Option<Uuid>,
        kind: TradeKind,
        reason: Option<CloseReason>,
        input: (&str, Decimal),
        output: (&str, Decimal),
        price: Decimal,
        fill: &Fill,
    ) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            agent_id: agent.agent_id.clone(),
            wallet_address: agent.wallet_address.clone(),
            position_id,
            kind,
            reason,
            input_mint: input.0.to_string(),
            output_mint: output.0.to_string(),
            input_amount: input.1,
            output_amount: output.1,
            price,
            protocol_fee_sol: fill.fees.protocol_fee_sol,
            network_fee_sol: fill.fees.network_fee_sol,
            price_impact_pct: fill.execution.price_impact_pct,
            transaction_hash: fill.execution.transaction_hash.clone(),
            simulated: fill.simulated,
            created_at: Utc::now(),
        }
    }

    /// One batch under the store transaction timeout
    async fn commit(&self, ops: Vec<WriteOp>) -> EngineResult<CommitReceipt> {
        let after = self.config.store_tx_timeout;
        match tokio::time::timeout(after, self.store.commit(ops)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout {
                operation: "store commit",
                after,
            }),
        }
    }

    async fn refresh_caches(&self, receipt: &CommitReceipt) {
        self.ledger.refresh(&receipt.balances).await;
        self.positions.refresh(&receipt.upserted_positions).await;
        self.positions.evict(&receipt.deleted_positions).await;
    }

    /// Best effort; the trade has already committed
    async fn record_history(&self, record: HistoricalSwap) {
        let position_id = record.position_id;
        if let Err(e) = self.dispatcher.enqueue(Job::RecordHistoricalSwap(record)).await {
            warn!("Failed to enqueue history for {}: {:#}", position_id, e);
        }
    }
}
