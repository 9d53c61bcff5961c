//! Synthetic market of one simulated session.
//!
//! Prices follow a small random walk around the last bid; the spread stays fixed. Every
//! `bar_ticks` ticks the running bar is closed and handed out as a `TimeBar`.
use chrono::Utc;
use mtbridge_common::event::TimeBar;
use mtbridge_common::response::MqlRates;
use rand::Rng;

/// Bars kept for history requests.
const HISTORY_LIMIT: usize = 500;

struct OpenBar {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    ticks: u32,
}

/// Quote state and bar history of one instrument.
pub struct Market {
    pub symbol: String,
    pub bid: f64,
    spread: f64,
    bar_ticks: u32,
    bar: OpenBar,
    history: Vec<MqlRates>,
}

impl Market {
    pub fn new(symbol: &str, bid: f64, spread: f64, bar_ticks: u32) -> Self {
        Market {
            symbol: symbol.to_string(),
            bid,
            spread,
            bar_ticks: bar_ticks.max(1),
            bar: OpenBar::starting_at(bid),
            history: Vec::new(),
        }
    }

    pub fn ask(&self) -> f64 {
        self.bid + self.spread
    }

    /// Next price of a small random walk around `current`, within ±0.05 %.
    pub fn next_price(current: f64) -> f64 {
        let mut rng = rand::rng();
        let change: f64 = rng.random_range(-0.0005..0.0005);
        let price = current * (1.0 + change);
        (price * 100_000.0).round() / 100_000.0
    }

    /// Advances one tick. Returns the bar it closed, if any.
    pub fn tick(&mut self) -> Option<TimeBar> {
        self.bid = Self::next_price(self.bid).max(0.00001);
        self.bar.high = self.bar.high.max(self.bid);
        self.bar.low = self.bar.low.min(self.bid);
        self.bar.ticks += 1;
        if self.bar.ticks < self.bar_ticks {
            return None;
        }
        let closed = std::mem::replace(&mut self.bar, OpenBar::starting_at(self.bid));
        let close_time = Utc::now().timestamp();
        self.history.push(MqlRates {
            time: closed.open_time,
            open: closed.open,
            high: closed.high,
            low: closed.low,
            close: self.bid,
            tick_volume: closed.ticks as i64,
            spread: 0,
            real_volume: 0,
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
        Some(TimeBar {
            symbol: self.symbol.clone(),
            open_time: closed.open_time as i32,
            close_time: close_time as i32,
            open: closed.open,
            close: self.bid,
            high: closed.high,
            low: closed.low,
        })
    }

    /// Up to `count` closed bars starting `start_pos` bars back from the newest, oldest first.
    pub fn rates_from_position(&self, start_pos: usize, count: usize) -> Vec<MqlRates> {
        let end = self.history.len().saturating_sub(start_pos);
        let begin = end.saturating_sub(count);
        self.history[begin..end].to_vec()
    }

    /// Closed bars opened within `[from, to]`.
    pub fn rates_between(&self, from: i64, to: i64) -> Vec<MqlRates> {
        self.history
            .iter()
            .filter(|r| r.time >= from && r.time <= to)
            .cloned()
            .collect()
    }
}

impl OpenBar {
    fn starting_at(price: f64) -> Self {
        OpenBar {
            open_time: Utc::now().timestamp(),
            open: price,
            high: price,
            low: price,
            ticks: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_closes_after_configured_ticks() {
        let mut market = Market::new("EURUSD", 1.1, 0.0002, 3);
        assert!(market.tick().is_none());
        assert!(market.tick().is_none());
        let bar = market.tick().unwrap();
        assert_eq!(bar.symbol, "EURUSD");
        assert!(bar.low <= bar.high);
        assert_eq!(market.rates_from_position(0, 10).len(), 1);
    }

    #[test]
    fn random_walk_stays_close() {
        let price = Market::next_price(1.2345);
        assert!((price - 1.2345).abs() < 0.001);
    }
}
