//! Operation group: branches the chain on a row predicate without changing the flat chain.

use anyhow::{Context, Result};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::host::RowHost;
use crate::pipeline::operation::{Chain, Operation};
use crate::{OpId, Row, RowRef, RowState};

pub type RowPredicate = Box<dyn Fn(&Row) -> bool + Send>;

/// Holds a Then and an Else sub-chain, replayed sequentially for each row.
///
/// Without a guard every row takes the Then branch. With a guard, rows failing it take the
/// Else branch when one exists, otherwise pass through untouched. Deferred operations are
/// rejected as children: a replayed branch cannot park rows.
pub struct OperationGroup {
    name: String,
    guard: Option<RowPredicate>,
    then_chain: Chain,
    else_chain: Chain,
}

impl OperationGroup {
    pub fn new() -> Self {
        Self {
            name: "OperationGroup".to_string(),
            guard: None,
            then_chain: Chain::with_prefix("OperationGroup/then"),
            else_chain: Chain::with_prefix("OperationGroup/else"),
        }
    }

    pub fn when(guard: impl Fn(&Row) -> bool + Send + 'static) -> Self {
        let mut group = Self::new();
        group.guard = Some(Box::new(guard));
        group
    }

    pub fn add_then_operation(&mut self, op: Box<dyn Operation>) -> PipelineResult<OpId> {
        self.check_child(op.as_ref())?;
        Ok(self.then_chain.push(op))
    }

    pub fn add_else_operation(&mut self, op: Box<dyn Operation>) -> PipelineResult<OpId> {
        self.check_child(op.as_ref())?;
        Ok(self.else_chain.push(op))
    }

    /// Builder form of [`OperationGroup::add_then_operation`].
    pub fn then(mut self, op: impl Operation + 'static) -> PipelineResult<Self> {
        self.add_then_operation(Box::new(op))?;
        Ok(self)
    }

    /// Builder form of [`OperationGroup::add_else_operation`].
    pub fn otherwise(mut self, op: impl Operation + 'static) -> PipelineResult<Self> {
        self.add_else_operation(Box::new(op))?;
        Ok(self)
    }

    pub fn then_chain(&self) -> &Chain {
        &self.then_chain
    }

    pub fn else_chain(&self) -> &Chain {
        &self.else_chain
    }

    fn check_child(&self, op: &dyn Operation) -> PipelineResult<()> {
        if op.deferred_batch_size().is_some() {
            return Err(PipelineError::InvalidGroupChild {
                group: self.name.clone(),
                child: op.kind().to_string(),
            });
        }
        Ok(())
    }
}

impl Default for OperationGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn replay(chain: &mut Chain, row: &RowRef, host: &RowHost) -> Result<()> {
    let mut next = chain.first();
    while let Some(id) = next {
        let name = chain.name(id).to_string();
        if let Some(op) = chain.op_mut(id) {
            op.apply(row, host).with_context(|| name)?;
        }
        if row.state() != RowState::Normal {
            break;
        }
        next = chain.next(id);
    }
    Ok(())
}

impl Operation for OperationGroup {
    fn kind(&self) -> &str {
        "OperationGroup"
    }

    fn set_number(&mut self, _number: usize, name: &str) {
        self.name = name.to_string();
        self.then_chain.set_prefix(format!("{name}/then"));
        self.else_chain.set_prefix(format!("{name}/else"));
    }

    fn prepare(&mut self, ctx: &PipelineContext) -> Result<()> {
        let prepared = self
            .then_chain
            .prepare_all(ctx)
            .and_then(|()| self.else_chain.prepare_all(ctx));
        if let Err(e) = prepared {
            let mut failures = self.then_chain.shutdown_all(ctx);
            failures.extend(self.else_chain.shutdown_all(ctx));
            for failure in failures {
                log::warn!("{}", failure);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn apply(&mut self, row: &RowRef, host: &RowHost) -> Result<()> {
        let take_then = self.guard.as_ref().is_none_or(|guard| guard(row.as_ref()));
        if take_then {
            replay(&mut self.then_chain, row, host)
        } else if !self.else_chain.is_empty() {
            replay(&mut self.else_chain, row, host)
        } else {
            Ok(())
        }
    }

    fn shutdown(&mut self, ctx: &PipelineContext) -> Result<()> {
        let mut failures = self.then_chain.shutdown_all(ctx);
        failures.extend(self.else_chain.shutdown_all(ctx));
        let mut failures = failures.into_iter();
        match failures.next() {
            Some(first) => {
                for rest in failures {
                    log::warn!("{}", rest);
                }
                Err(first.into())
            }
            None => Ok(()),
        }
    }
}
