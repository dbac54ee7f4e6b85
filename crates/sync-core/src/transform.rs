//! Transformer hook run on every record before it is written.

use crate::document::Record;
use async_trait::async_trait;

/// Whether a transformed record may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Veto,
}

/// Inspect or mutate a record before it is materialized.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, record: &mut Record) -> Verdict;
}

/// Leaves every record untouched.
pub struct Identity;

#[async_trait]
impl Transformer for Identity {
    async fn transform(&self, _record: &mut Record) -> Verdict {
        Verdict::Keep
    }
}

#[async_trait]
impl<F> Transformer for F
where
    F: Fn(&mut Record) -> Verdict + Send + Sync,
{
    async fn transform(&self, record: &mut Record) -> Verdict {
        self(record)
    }
}
