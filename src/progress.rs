/// Advisory progress lines, one per tenth of the work.
#[derive(Debug, Clone)]
pub struct Progress {
    label: String,
    total: usize,
    done: usize,
    next_tenth: usize,
}

impl Progress {
    pub fn new(label: &str, total: usize) -> Self {
        Self { label: label.to_string(), total, done: 0, next_tenth: 1 }
    }

    pub fn advance(&mut self) {
        self.done += 1;
        if self.total == 0 {
            return;
        }
        if self.done * 10 >= self.next_tenth * self.total || self.done == self.total {
            tracing::info!(
                "{}: {}/{} ({:.0}%)",
                self.label,
                self.done,
                self.total,
                self.fraction() * 100.0
            );
            self.next_tenth = self.done * 10 / self.total + 1;
        }
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}
