use serde::Serialize;

/// Mean reciprocal rank and Hits@{1,3,10,100} over 1-based ranks.
///
/// Fields hold running sums until [`RankMetrics::finalize`] divides them by
/// `count`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RankMetrics {
    /// Mean reciprocal rank.
    pub mrr: f64,
    /// Fraction ranked first.
    pub hits1: f64,
    /// Fraction ranked in the top 3.
    pub hits3: f64,
    /// Fraction ranked in the top 10.
    pub hits10: f64,
    /// Fraction ranked in the top 100.
    pub hits100: f64,
    /// Ranks accumulated.
    pub count: u64,
}

impl RankMetrics {
    /// Adds one rank. Rank 0 is treated as rank 1.
    pub fn accumulate(&mut self, rank: u64) {
        let rank = rank.max(1);
        self.count += 1;
        self.mrr += 1.0 / rank as f64;
        self.hits1 += f64::from(u8::from(rank <= 1));
        self.hits3 += f64::from(u8::from(rank <= 3));
        self.hits10 += f64::from(u8::from(rank <= 10));
        self.hits100 += f64::from(u8::from(rank <= 100));
    }

    /// Turns sums into means. No-op when nothing was accumulated.
    pub fn finalize(&mut self) {
        if self.count == 0 {
            return;
        }
        let n = self.count as f64;
        self.mrr /= n;
        self.hits1 /= n;
        self.hits3 /= n;
        self.hits10 /= n;
        self.hits100 /= n;
    }

    /// Adds another accumulator's unfinalized sums.
    pub fn merge(&mut self, other: &RankMetrics) {
        self.count += other.count;
        self.mrr += other.mrr;
        self.hits1 += other.hits1;
        self.hits3 += other.hits3;
        self.hits10 += other.hits10;
        self.hits100 += other.hits100;
    }
}
