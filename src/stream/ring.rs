/// Fixed-capacity circular buffer. Pushing past capacity overwrites the
/// oldest entry; iteration is always oldest-to-newest.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    values: Vec<T>,
    capacity: usize,
    cursor: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            self.values[self.cursor] = value;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        if self.values.is_empty() {
            return None;
        }
        let index = (self.cursor + self.capacity - 1) % self.capacity;
        self.values.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let split = if self.values.len() < self.capacity {
            0
        } else {
            self.cursor
        };
        let (newer, older) = self.values.split_at(split);
        older.iter().chain(newer.iter())
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.cursor = 0;
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
