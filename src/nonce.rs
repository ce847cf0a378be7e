// src/nonce.rs
use std::sync::Arc;

use ethers::types::U256;
use tokio::sync::Mutex;
use tracing::info;

use crate::chain::RelayChain;
use crate::error::ChainError;

/// Issues the signer account's transaction nonces.
///
/// The counter is read from the chain's pending transaction count on the first
/// reservation and is owned by this manager afterwards, so no other process may
/// send from the same signer. Reservations queue on a fair async mutex, which
/// hands out values in request order without gaps or repeats.
pub struct NonceManager<C> {
    chain: Arc<C>,
    next: Mutex<Option<U256>>,
}

impl<C: RelayChain> NonceManager<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self {
            chain,
            next: Mutex::new(None),
        }
    }

    pub async fn reserve(&self) -> Result<U256, ChainError> {
        let mut next = self.next.lock().await;
        let nonce = match *next {
            Some(n) => n,
            None => {
                let n = self.chain.pending_nonce().await?;
                info!(nonce = %n, "initialized signer nonce from chain");
                n
            }
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Next value `reserve` would hand out, if initialized.
    pub async fn peek(&self) -> Option<U256> {
        *self.next.lock().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::chain::MockRelayChain;

    #[tokio::test]
    async fn initializes_lazily_and_only_once() {
        let mut chain = MockRelayChain::new();
        chain
            .expect_pending_nonce()
            .times(1)
            .returning(|| Ok(U256::from(7)));
        let manager = NonceManager::new(Arc::new(chain));

        assert_eq!(manager.peek().await, None);
        assert_eq!(manager.reserve().await.unwrap(), U256::from(7));
        assert_eq!(manager.reserve().await.unwrap(), U256::from(8));
        assert_eq!(manager.peek().await, Some(U256::from(9)));
    }

    #[tokio::test]
    async fn failed_initialization_is_retried() {
        let mut chain = MockRelayChain::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_pending_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(ChainError::Rpc("down".into())));
        chain
            .expect_pending_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(U256::from(3)));
        let manager = NonceManager::new(Arc::new(chain));

        assert!(manager.reserve().await.is_err());
        assert_eq!(manager.reserve().await.unwrap(), U256::from(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_are_unique_and_gap_free() {
        let mut chain = MockRelayChain::new();
        chain
            .expect_pending_nonce()
            .times(1)
            .returning(|| Ok(U256::from(40)));
        let manager = Arc::new(NonceManager::new(Arc::new(chain)));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.reserve().await.unwrap() }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }

        let expected: HashSet<U256> = (40u64..140).map(U256::from).collect();
        assert_eq!(seen, expected);
    }
}
