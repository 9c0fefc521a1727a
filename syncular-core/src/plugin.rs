//! Push-engine plugin hooks (spec §4.1, §9 open question (a)). Plugins
//! observe and may annotate an operation around `applyOperation`, but may
//! not change its `table`/`rowId`/`op`. Run order is `(priority, insertion
//! index)`; commutativity across plugins touching the same emitted change
//! is the plugin author's responsibility, not the registry's.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SyncResult;
use crate::models::Op;
use crate::protocol::OperationResult;

/// The operation a plugin observes, mutable only in its `payload`.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub table: String,
    pub row_id: String,
    pub op: Op,
    pub payload: Option<Value>,
    pub base_version: Option<i64>,
}

#[async_trait]
pub trait PushPlugin: Send + Sync {
    /// Lower runs first. Defaults to `0`; ties broken by registration order.
    fn priority(&self) -> i32 {
        0
    }

    async fn before_apply_operation(&self, _ctx: &mut OperationContext) -> SyncResult<()> {
        Ok(())
    }

    async fn after_apply_operation(
        &self,
        _ctx: &OperationContext,
        _result: &OperationResult,
    ) -> SyncResult<()> {
        Ok(())
    }
}

/// Holds plugins in stable `(priority, insertion index)` order.
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<std::sync::Arc<dyn PushPlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: std::sync::Arc<dyn PushPlugin>) {
        self.plugins.push(plugin);
        self.plugins.sort_by_key(|p| p.priority());
    }

    pub async fn run_before(&self, ctx: &mut OperationContext) -> SyncResult<()> {
        for plugin in &self.plugins {
            plugin.before_apply_operation(ctx).await?;
        }
        Ok(())
    }

    pub async fn run_after(
        &self,
        ctx: &OperationContext,
        result: &OperationResult,
    ) -> SyncResult<()> {
        for plugin in &self.plugins {
            plugin.after_apply_operation(ctx, result).await?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct OrderRecorder {
        priority: i32,
        order: Arc<std::sync::Mutex<Vec<i32>>>,
    }

    #[async_trait]
    impl PushPlugin for OrderRecorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn before_apply_operation(&self, _ctx: &mut OperationContext) -> SyncResult<()> {
            self.order.lock().unwrap().push(self.priority);
            Ok(())
        }
    }

    #[tokio::test]
    async fn plugins_run_in_priority_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = PluginChain::new();
        chain.register(Arc::new(OrderRecorder { priority: 5, order: order.clone() }));
        chain.register(Arc::new(OrderRecorder { priority: -1, order: order.clone() }));
        chain.register(Arc::new(OrderRecorder { priority: 0, order: order.clone() }));

        let mut ctx = OperationContext {
            table: "tasks".into(),
            row_id: "t1".into(),
            op: Op::Upsert,
            payload: None,
            base_version: None,
        };
        chain.run_before(&mut ctx).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![-1, 0, 5]);
    }

    #[test]
    fn empty_chain_reports_empty() {
        assert!(PluginChain::new().is_empty());
    }
}
