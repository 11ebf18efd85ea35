use crate::failed::FailedRegisterCache;
use crate::registers::RegisterDescriptor;

/// Contiguous word range read with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBatch {
    pub start: u16,
    /// Words covered, including the second word of double-word registers.
    pub count: u16,
    /// Start address of every register decoded from this batch.
    pub registers: Vec<u16>,
}

impl RegisterBatch {
    fn single(descriptor: &RegisterDescriptor) -> Self {
        Self {
            start: descriptor.address,
            count: descriptor.words(),
            registers: vec![descriptor.address],
        }
    }

    pub fn end(&self) -> u16 {
        self.start + (self.count - 1)
    }

    pub fn is_single(&self) -> bool {
        self.registers.len() == 1
    }

    /// Halve the batch by register count. `None` for a single register.
    pub fn split(&self) -> Option<(RegisterBatch, RegisterBatch)> {
        if self.is_single() {
            return None;
        }
        let mid = self.registers.len() / 2;
        let (head, tail) = self.registers.split_at(mid);
        let tail_start = tail[0];
        Some((
            RegisterBatch {
                start: self.start,
                count: tail_start - self.start,
                registers: head.to_vec(),
            },
            RegisterBatch {
                start: tail_start,
                count: self.end() - tail_start + 1,
                registers: tail.to_vec(),
            },
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<RegisterBatch>,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn contains(&self, address: u16) -> bool {
        self.batches.iter().any(|b| b.registers.contains(&address))
    }

    pub fn register_count(&self) -> usize {
        self.batches.iter().map(|b| b.registers.len()).sum()
    }
}

/// Group registers into contiguous reads of at most `max_batch_size` words.
///
/// Registers in `failed` are dropped. A double-word register is never split
/// across requests, so with `max_batch_size == 1` it still gets a two-word
/// batch of its own; that is the only batch allowed to exceed the limit.
pub fn plan<'a>(
    registers: impl IntoIterator<Item = &'a RegisterDescriptor>,
    max_batch_size: u16,
    failed: &FailedRegisterCache,
) -> BatchPlan {
    let max_batch_size = max_batch_size.max(1);
    let mut remaining: Vec<&RegisterDescriptor> = registers
        .into_iter()
        .filter(|r| !failed.contains(r.address))
        .collect();
    remaining.sort_by_key(|r| r.address);

    let mut batches: Vec<RegisterBatch> = Vec::new();
    for descriptor in remaining {
        if let Some(current) = batches.last_mut() {
            let adjacent = current.end().checked_add(1) == Some(descriptor.address);
            let fits = u32::from(current.count) + u32::from(descriptor.words())
                <= u32::from(max_batch_size);
            if adjacent && fits {
                current.count += descriptor.words();
                current.registers.push(descriptor.address);
                continue;
            }
        }
        batches.push(RegisterBatch::single(descriptor));
    }

    tracing::debug!(
        "Planned {} batches for {} registers ({} excluded)",
        batches.len(),
        batches.iter().map(|b| b.registers.len()).sum::<usize>(),
        failed.len()
    );
    BatchPlan { batches }
}
