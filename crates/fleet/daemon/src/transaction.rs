//! Unit of work with post-commit actions
//!
//! A [`UnitOfWork`] wraps one storage transaction. Actions registered with
//! [`UnitOfWork::register_post_commit`] run after, and only if, the
//! transaction commits, in registration order. Signals raised this way can
//! never announce a change that was rolled back.

use crate::error::{FleetError, FleetResult};
use crate::storage::{FleetStore, FleetTx};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::ops::{Deref, DerefMut};

enum PostCommitAction {
    Call(Box<dyn FnOnce() + Send>),
    Task(BoxFuture<'static, ()>),
}

/// One transaction plus the actions to run once it commits
pub struct UnitOfWork<T> {
    tx: T,
    post_commit: Vec<PostCommitAction>,
    rollback_only: bool,
}

impl<T: FleetTx> UnitOfWork<T> {
    /// Begin a transaction on `store`
    pub async fn begin<S>(store: &S) -> FleetResult<Self>
    where
        S: FleetStore<Tx = T>,
    {
        let tx = store.begin().await?;
        Ok(Self {
            tx,
            post_commit: Vec::new(),
            rollback_only: false,
        })
    }

    /// Run `action` after the transaction commits
    pub fn register_post_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.post_commit.push(PostCommitAction::Call(Box::new(action)));
    }

    /// Await `task` after the transaction commits
    pub fn register_post_commit_task(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.post_commit.push(PostCommitAction::Task(task.boxed()));
    }

    /// Make the eventual [`resolve`](Self::resolve) roll back even on success
    pub fn mark_for_rollback(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.rollback_only
    }

    /// Commit and run the post-commit actions. A unit marked for rollback
    /// is rolled back instead and its actions are dropped.
    pub async fn commit(self) -> FleetResult<()> {
        if self.rollback_only {
            return self.rollback().await;
        }

        self.tx.commit().await?;
        for action in self.post_commit {
            match action {
                PostCommitAction::Call(call) => call(),
                PostCommitAction::Task(task) => task.await,
            }
        }
        Ok(())
    }

    /// Roll back, dropping every post-commit action
    pub async fn rollback(self) -> FleetResult<()> {
        self.tx.rollback().await.map_err(FleetError::from)
    }

    /// Commit if `result` is `Ok`, roll back otherwise, and hand `result` back.
    /// A failed commit replaces `Ok` with the commit error.
    pub async fn resolve<R>(mut self, result: FleetResult<R>) -> FleetResult<R> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.mark_for_rollback();
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

impl<T> Deref for UnitOfWork<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.tx
    }
}

impl<T> DerefMut for UnitOfWork<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConnectorRepository, InMemoryStore};
    use fleet_types::{CatalogTypeId, Connector, ConnectorId};
    use std::sync::{Arc, Mutex};

    fn create_test_connector() -> Connector {
        Connector::new(
            ConnectorId::new("c1"),
            "c1",
            "alice",
            CatalogTypeId::new("log_sink_0.1"),
            "stable",
        )
    }

    #[tokio::test]
    async fn test_post_commit_runs_in_order_after_commit() {
        let store = InMemoryStore::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.insert_connector(create_test_connector()).await.unwrap();
        for i in 0..3 {
            let calls = calls.clone();
            uow.register_post_commit(move || calls.lock().unwrap().push(i));
        }
        let task_calls = calls.clone();
        uow.register_post_commit_task(async move { task_calls.lock().unwrap().push(3) });
        assert!(calls.lock().unwrap().is_empty());

        uow.resolve(Ok(())).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_post_commit_skipped_on_error() {
        let store = InMemoryStore::new();
        let calls = Arc::new(Mutex::new(0));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.insert_connector(create_test_connector()).await.unwrap();
        let counter = calls.clone();
        uow.register_post_commit(move || *counter.lock().unwrap() += 1);

        let result: FleetResult<()> = uow
            .resolve(Err(FleetError::Validation("bad".into())))
            .await;
        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 0);

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        assert!(uow.get_connector(&ConnectorId::new("c1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_marked_unit_rolls_back_on_commit() {
        let store = InMemoryStore::new();
        let calls = Arc::new(Mutex::new(0));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.insert_connector(create_test_connector()).await.unwrap();
        let counter = calls.clone();
        uow.register_post_commit(move || *counter.lock().unwrap() += 1);
        uow.mark_for_rollback();
        uow.commit().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 0);
        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        assert!(uow.get_connector(&ConnectorId::new("c1")).await.unwrap().is_none());
    }
}
