// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Outcome of one state step: move to the next state, stay and run the same
/// state again, or finish the session.
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

pub trait StateMachine<Ctx, StepOut>: Sized {
    type StepResult<'a>: Future<Output = StepOut> + Send + 'a
    where
        Self: 'a,
        StepOut: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Driver for a session context: loops over [`StateMachine::step`] results
/// until a terminal transition, producing the session outcome.
pub trait StateMachineCtx<Ctx, Outcome> {
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<Outcome>;
}
