//! Groups sparse register addresses into contiguous read requests.

use crate::register::Register;

/// Limits applied while grouping registers into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Largest number of unused words allowed between two registers of one batch.
    pub max_gap: u16,
    /// Largest number of words a single read may request.
    pub max_words: u16,
}

impl BatchConfig {
    /// Modbus allows at most 125 registers per read request.
    pub const MODBUS_MAX_WORDS: u16 = 125;
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_gap: 10,
            max_words: 100,
        }
    }
}

/// Registers read together in a single wire transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<'a> {
    registers: Vec<&'a Register>,
    end: u32,
}

impl<'a> Batch<'a> {
    fn new(register: &'a Register) -> Self {
        Self {
            registers: vec![register],
            end: register.end(),
        }
    }

    fn push(&mut self, register: &'a Register) {
        self.end = self.end.max(register.end());
        self.registers.push(register);
    }

    pub fn registers(&self) -> &[&'a Register] {
        &self.registers
    }

    /// Address of the first register.
    pub fn start(&self) -> u16 {
        self.registers[0].address
    }

    /// Number of words to request, covering every register and the gaps between them.
    pub fn word_count(&self) -> u16 {
        (self.end - self.start() as u32) as u16
    }

    /// Cuts a response buffer into one slice per register.
    ///
    /// Each register starts at its word offset from the batch start. The last
    /// register receives the remainder of the buffer rather than a fixed slice.
    /// Registers the buffer does not reach get an empty slice, which fails to
    /// decode and is discarded by the caller.
    pub fn split<'b>(&self, buffer: &'b [u8]) -> Vec<(&'a Register, &'b [u8])> {
        let last = self.registers.len() - 1;
        self.registers
            .iter()
            .enumerate()
            .map(|(index, register)| {
                let offset = (register.address - self.start()) as usize * 2;
                let end = if index == last {
                    buffer.len()
                } else {
                    (offset + register.byte_len()).min(buffer.len())
                };
                let slice = buffer.get(offset..end).unwrap_or(&[]);
                (*register, slice)
            })
            .collect()
    }
}

/// Plans the reads for `registers`, which must be sorted by address.
///
/// The current batch is extended while the next register starts at most
/// `max_gap` words after the batch end and the batch stays within
/// `max_words`. A register longer than `max_words` still forms its own batch.
pub fn plan<'a, I>(registers: I, config: &BatchConfig) -> Vec<Batch<'a>>
where
    I: IntoIterator<Item = &'a Register>,
{
    let mut batches: Vec<Batch<'a>> = Vec::new();
    for register in registers {
        match batches.last_mut() {
            Some(batch)
                if register.address as u32 <= batch.end + config.max_gap as u32
                    && register.end().max(batch.end) - batch.start() as u32
                        <= config.max_words as u32 =>
            {
                batch.push(register)
            }
            _ => batches.push(Batch::new(register)),
        }
    }
    log::debug!(
        "Planned {} batch(es): {:?}",
        batches.len(),
        batches
            .iter()
            .map(|b| (b.start(), b.word_count()))
            .collect::<Vec<_>>()
    );
    batches
}
