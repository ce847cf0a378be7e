// src/store.rs
use std::collections::{HashMap, VecDeque};

use ethers::types::H256;
use parking_lot::Mutex;

use crate::types::{LogEntry, LogLevel, Receipt};
use crate::user_op::now_millis;

struct Receipts {
    by_hash: HashMap<H256, Receipt>,
    order: VecDeque<H256>,
}

/// In-memory receipts and diagnostic log lines, both bounded.
///
/// Receipts are evicted oldest-inserted first; overwriting an existing hash
/// keeps its original insertion slot.
pub struct Store {
    receipt_capacity: usize,
    log_capacity: usize,
    receipts: Mutex<Receipts>,
    logs: Mutex<VecDeque<LogEntry>>,
}

impl Store {
    pub fn new(receipt_capacity: usize, log_capacity: usize) -> Self {
        Self {
            receipt_capacity,
            log_capacity,
            receipts: Mutex::new(Receipts {
                by_hash: HashMap::new(),
                order: VecDeque::new(),
            }),
            logs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn save_receipt(&self, receipt: Receipt) {
        let mut receipts = self.receipts.lock();
        let hash = receipt.user_op_hash;
        if receipts.by_hash.insert(hash, receipt).is_none() {
            receipts.order.push_back(hash);
        }
        while receipts.by_hash.len() > self.receipt_capacity {
            match receipts.order.pop_front() {
                Some(oldest) => {
                    receipts.by_hash.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn get_receipt(&self, hash: &H256) -> Option<Receipt> {
        self.receipts.lock().by_hash.get(hash).cloned()
    }

    pub fn append_log(&self, entry: LogEntry) {
        let mut logs = self.logs.lock();
        logs.push_back(entry);
        while logs.len() > self.log_capacity {
            logs.pop_front();
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, user_op_hash: Option<H256>) {
        self.append_log(LogEntry {
            timestamp: now_millis(),
            level,
            message: message.into(),
            user_op_hash,
        });
    }

    /// The most recent `limit` lines, oldest first.
    pub fn get_logs(&self, limit: usize) -> Vec<LogEntry> {
        let logs = self.logs.lock();
        let skip = logs.len().saturating_sub(limit);
        logs.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Address;

    use super::*;
    use crate::types::ReceiptStatus;

    fn receipt(n: u64) -> Receipt {
        Receipt {
            user_op_hash: H256::from_low_u64_be(n),
            entry_point: Address::zero(),
            sender: Address::zero(),
            nonce: None,
            success: true,
            status: ReceiptStatus::Succeeded,
            actual_gas_used: None,
            actual_gas_cost: None,
            reason: None,
            transaction_hash: None,
            received_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn evicts_first_inserted_receipt() {
        let store = Store::new(3, 10);
        for n in 0..4 {
            store.save_receipt(receipt(n));
        }
        assert!(store.get_receipt(&H256::from_low_u64_be(0)).is_none());
        for n in 1..4 {
            assert!(store.get_receipt(&H256::from_low_u64_be(n)).is_some());
        }
    }

    #[test]
    fn upsert_does_not_grow_the_store() {
        let store = Store::new(2, 10);
        store.save_receipt(receipt(1));
        let mut failed = receipt(1);
        failed.success = false;
        store.save_receipt(failed);
        store.save_receipt(receipt(2));
        assert!(!store.get_receipt(&H256::from_low_u64_be(1)).unwrap().success);
        assert!(store.get_receipt(&H256::from_low_u64_be(2)).is_some());
    }

    #[test]
    fn log_ring_keeps_most_recent() {
        let store = Store::new(1, 3);
        for n in 0..5 {
            store.log(LogLevel::Info, format!("line {n}"), None);
        }
        let logs = store.get_logs(10);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "line 2");
        let last = store.get_logs(1);
        assert_eq!(last[0].message, "line 4");
    }
}
