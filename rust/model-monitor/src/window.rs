/// Fixed-capacity ring buffer; pushing into a full window evicts the oldest value in O(1).
#[derive(Debug, Clone)]
pub struct RingWindow<T> {
    slots: Vec<T>,
    capacity: usize,
    head: usize,
}

impl<T: Clone> RingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    /// Appends `value`, returning the evicted oldest value when the window was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
            return None;
        }
        let evicted = std::mem::replace(&mut self.slots[self.head], value);
        self.head = (self.head + 1) % self.capacity;
        Some(evicted)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = 0;
    }

    /// Values oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let (newer, older) = self.slots.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl RingWindow<f64> {
    pub fn mean(&self) -> Option<f64> {
        if self.slots.is_empty() {
            return None;
        }
        Some(self.slots.iter().sum::<f64>() / self.slots.len() as f64)
    }
}
