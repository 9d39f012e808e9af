use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What kind of domain object a liquidity account backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountKind {
    Asset,
    Peer,
    Incoming,
    Outgoing,
    WebMonetization,
}

/// A ledger account bound to a domain object. The id is the domain object's
/// own id, so lookups never need a join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityAccount {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub kind: AccountKind,
}

impl LiquidityAccount {
    pub fn new(id: Uuid, asset_id: Uuid, kind: AccountKind) -> Self {
        LiquidityAccount { id, asset_id, kind }
    }
}

/// Reaction to a settled credit on a liquidity account.
///
/// Incoming payments use this to advance their state machine; wallet
/// addresses use it to schedule web-monetization withdrawal events.
#[async_trait]
pub trait CreditHook: Send + Sync {
    async fn on_credit(&self, account_id: Uuid, total_received: u64);
}

/// Registry of credit hooks, keyed by the kind of account that was credited.
///
/// Hook registration happens once during startup wiring; at-most-one hook
/// per kind.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<AccountKind, Arc<dyn CreditHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: AccountKind, hook: Arc<dyn CreditHook>) {
        self.hooks.write().insert(kind, hook);
    }

    pub fn get(&self, kind: AccountKind) -> Option<Arc<dyn CreditHook>> {
        self.hooks.read().get(&kind).cloned()
    }
}
