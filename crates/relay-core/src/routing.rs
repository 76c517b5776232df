// Routing actor
//
// Classifies free-form input against a rule set and hands execution to a
// reasoning delegate chosen by the matched rule. While a delegate is active,
// each new input is classified again concurrently with draining the
// delegate's current round; the decision is applied at the delegate's next
// round boundary:
// - a different rule switches to a new delegate (the old one closes in the background)
// - the same rule, or no rule at all, forwards the input to the active delegate
// - a delegate that finished moves on to the next matched intent
//
// Each `input` starts a round: a spawned task that reports to `next` through
// a bounded queue owned by the actor. A new `input` cancels the previous round
// first; delegate events that round already forwarded stay queued, only its
// boundary is dropped. Anything that touches the delegate itself (pulling its
// next event, starting it) runs in a task of its own under the handoff lock,
// so a cancelled round can neither lose a pulled event nor strand a delegate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::actor::{Actor, StateHandle};
use crate::config::ActorConfig;
use crate::definition::{ActorDefinition, ActorKind, DelegateRef, ReasoningDefinition, RoutingDefinition, RuleRef};
use crate::error::{ActorError, Result};
use crate::events::{AgentEvent, EventKind};
use crate::reasoning::ReasoningActor;
use crate::rules::Matcher;
use crate::state::{RoutingPhase, RoutingState};
use crate::traits::Runtime;

pub use crate::state::MatchedIntent;

/// Queue entry, tagged with the generation of the round that produced it
type Queued = (u64, RoundItem);

enum RoundItem {
    Event(Result<AgentEvent>),
    /// The round returned without reporting its own boundary
    Done,
}

/// A rule-based routing actor
pub struct RoutingActor {
    shared: Arc<RoutingShared>,
}

struct RoutingShared {
    definition: RoutingDefinition,
    runtime: Arc<dyn Runtime>,
    state: Arc<dyn RoutingState>,
    state_id: String,
    matcher: Matcher,
    /// Rule name -> delegate
    routes: HashMap<String, DelegateRef>,
    model: String,
    config: ActorConfig,
    cancel: CancellationToken,
    input_ready: Notify,
    queue_tx: mpsc::Sender<Queued>,
    queue_rx: Mutex<mpsc::Receiver<Queued>>,
    /// Held by delegate work that must outlive a cancelled round
    handoff: Arc<Mutex<()>>,
    inner: Mutex<RoutingLifecycle>,
}

#[derive(Default)]
struct RoutingLifecycle {
    delegate: Option<Arc<ReasoningActor>>,
    /// The delegate reached `Eof` and is waiting for input
    delegate_idle: bool,
    round: Option<Round>,
    generation: u64,
    closed: bool,
    interrupted: bool,
}

struct Round {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// The round reported its boundary; `next` waits for new input
    drained: bool,
}

/// A round's handle on the actor's queue
struct RoundQueue {
    generation: u64,
    tx: mpsc::Sender<Queued>,
}

impl RoundQueue {
    async fn send(&self, item: Result<AgentEvent>) {
        let _ = self.tx.send((self.generation, RoundItem::Event(item))).await;
    }

    async fn finish(&self) {
        let _ = self.tx.send((self.generation, RoundItem::Done)).await;
    }

    async fn reserve(&self) -> Result<mpsc::OwnedPermit<Queued>> {
        self.tx
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| ActorError::Closed)
    }
}

/// How the delegate's current round ended
enum Boundary {
    AwaitingInput,
    Finished,
}

enum Polled<T> {
    Cancelled,
    Ready(T),
}

impl RoutingActor {
    /// Create a routing actor with a freshly allocated state
    pub async fn new(
        runtime: Arc<dyn Runtime>,
        definition: RoutingDefinition,
        parent_state_id: Option<&str>,
    ) -> Result<Self> {
        definition.validate()?;
        let state = runtime
            .create_routing_state(&definition.name, parent_state_id)
            .await?;
        let state_id = state.id().to_string();

        match Self::build(Arc::clone(&runtime), definition, state).await {
            Ok(actor) => Ok(actor),
            Err(e) => {
                if let Err(destroy_err) = runtime.destroy_state(&state_id, false).await {
                    warn!(state_id = %state_id, error = %destroy_err, "failed to release state of unbuilt actor");
                }
                Err(e)
            }
        }
    }

    /// Rebuild a routing actor around an existing state. A state that was
    /// executing gets its delegate rebuilt from the nested delegate state.
    pub async fn with_state(
        runtime: Arc<dyn Runtime>,
        definition: RoutingDefinition,
        state: Arc<dyn RoutingState>,
    ) -> Result<Self> {
        let actor = Self::build(runtime, definition, state).await?;
        actor.shared.restore_delegate().await?;
        Ok(actor)
    }

    async fn build(
        runtime: Arc<dyn Runtime>,
        definition: RoutingDefinition,
        state: Arc<dyn RoutingState>,
    ) -> Result<Self> {
        definition.validate()?;

        let mut rules = Vec::with_capacity(definition.rules.len());
        for rule_ref in &definition.rules {
            match rule_ref {
                RuleRef::Ref { reference } => rules.push(runtime.get_rule(reference).await?),
                RuleRef::Inline(rule) => rules.push(rule.clone()),
            }
        }
        let matcher = Matcher::compile(&rules)?;

        let mut routes = HashMap::new();
        for route in &definition.routes {
            for rule in &route.rules {
                if !matcher.has_rule(rule) {
                    warn!(actor = %definition.name, rule = %rule, "route names a rule that is not declared");
                }
                routes.insert(rule.clone(), route.agent.clone());
            }
        }

        let state_id = state.id().to_string();
        let config = runtime.actor_config();
        let (queue_tx, queue_rx) = mpsc::channel(config.channel_capacity());
        info!(
            actor = %definition.name,
            state_id = %state_id,
            rules = rules.len(),
            routes = routes.len(),
            "routing actor ready"
        );

        Ok(Self {
            shared: Arc::new(RoutingShared {
                model: definition.generator.model.clone(),
                config,
                definition,
                runtime,
                state,
                state_id,
                matcher,
                routes,
                cancel: CancellationToken::new(),
                input_ready: Notify::new(),
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                handoff: Arc::new(Mutex::new(())),
                inner: Mutex::new(RoutingLifecycle::default()),
            }),
        })
    }

    pub fn routing_definition(&self) -> &RoutingDefinition {
        &self.shared.definition
    }

    pub fn routing_state(&self) -> Arc<dyn RoutingState> {
        Arc::clone(&self.shared.state)
    }

    /// The active delegate, if any
    pub async fn delegate(&self) -> Option<Arc<ReasoningActor>> {
        self.shared.inner.lock().await.delegate.clone()
    }
}

impl RoutingShared {
    fn tag(&self, event: AgentEvent, phase: RoutingPhase) -> AgentEvent {
        event
            .from_actor(&self.definition.name, &self.state_id)
            .with_phase(phase.as_str())
    }

    async fn restore_delegate(&self) -> Result<()> {
        if self.state.phase().await != RoutingPhase::Executing {
            return Ok(());
        }
        let Some(delegate_state) = self.state.delegate_state().await else {
            return Ok(());
        };

        let definition = match self.state.current_intent().await {
            Some(intent) => self.resolve_delegate(&intent.target).await?,
            None => match self
                .runtime
                .get_actor_definition(delegate_state.definition_name())
                .await?
            {
                ActorDefinition::Reasoning(def) => def,
                ActorDefinition::Routing(def) => return Err(ActorError::NestedRouting(def.name)),
            },
        };

        let delegate = ReasoningActor::with_state_in(
            Arc::clone(&self.runtime),
            definition,
            delegate_state,
            &self.cancel,
        )
        .await?;
        info!(
            actor = %self.definition.name,
            state_id = %self.state_id,
            delegate_state_id = %delegate.state_id(),
            "restored delegate"
        );

        let mut inner = self.inner.lock().await;
        inner.delegate = Some(Arc::new(delegate));
        inner.delegate_idle = true;
        Ok(())
    }

    // ========================================================================
    // Caller entry points
    // ========================================================================

    async fn input(self: &Arc<Self>, text: &str) -> Result<()> {
        let previous = {
            let mut inner = self.inner.lock().await;
            if inner.closed || inner.interrupted {
                return Err(ActorError::Closed);
            }
            inner.round.take()
        };
        if let Some(round) = previous {
            round.cancel.cancel();
            let _ = round.handle.await;
        }
        // Let delegate work of the replaced round settle
        let handoff = self.handoff.lock().await;

        let mut inner = self.inner.lock().await;
        if inner.closed || inner.interrupted {
            return Err(ActorError::Closed);
        }

        if inner.delegate.is_none() {
            let accumulated = self.state.input().await;
            if accumulated.is_empty() {
                self.state.set_input(text.to_string()).await;
            } else {
                self.state.set_input(format!("{} {}", accumulated, text)).await;
            }
        }

        inner.generation += 1;
        let queue = RoundQueue {
            generation: inner.generation,
            tx: self.queue_tx.clone(),
        };
        let cancel = self.cancel.child_token();
        let span = info_span!(
            "routing_round",
            actor = %self.definition.name,
            state_id = %self.state_id
        );
        let shared = Arc::clone(self);
        let round_cancel = cancel.clone();
        let text = text.to_string();
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    _ = round_cancel.cancelled() => debug!("routing round cancelled"),
                    _ = shared.run_round(text, round_cancel.clone(), queue) => {}
                }
            }
            .instrument(span),
        );

        inner.round = Some(Round {
            generation: inner.generation,
            cancel,
            handle,
            drained: false,
        });
        drop(inner);
        drop(handoff);

        self.input_ready.notify_one();
        Ok(())
    }

    async fn next(&self) -> Result<AgentEvent> {
        loop {
            let generation = {
                let inner = self.inner.lock().await;
                if inner.closed {
                    return Ok(self.tag(AgentEvent::closed(), RoutingPhase::Idle));
                }
                if inner.interrupted {
                    return Ok(self.tag(AgentEvent::interrupted(), RoutingPhase::Idle));
                }
                match inner.round.as_ref() {
                    Some(round) if !round.drained => Some(round.generation),
                    _ => None,
                }
            };

            let Some(generation) = generation else {
                let notified = self.input_ready.notified();
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = notified => {}
                }
                continue;
            };

            let mut rx = self.queue_rx.lock().await;
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => Polled::Cancelled,
                item = rx.recv() => Polled::Ready(item),
            };
            drop(rx);

            let (from, item) = match polled {
                Polled::Cancelled => continue,
                Polled::Ready(Some(queued)) => queued,
                // the actor holds a sender for its whole life
                Polled::Ready(None) => return Err(ActorError::Closed),
            };
            let current = from == generation;

            match item {
                RoundItem::Event(Ok(event)) => {
                    let boundary =
                        event.kind == EventKind::Eof && event.actor_state_id == self.state_id;
                    if !boundary {
                        return Ok(event);
                    }
                    if current && self.mark_drained(from).await {
                        return Ok(event);
                    }
                    debug!(state_id = %self.state_id, generation = from, "dropping boundary of a replaced round");
                }
                RoundItem::Event(Err(e)) => {
                    if current {
                        return Err(e);
                    }
                    debug!(state_id = %self.state_id, generation = from, error = %e, "dropping error of a replaced round");
                }
                RoundItem::Done => {
                    if current && self.mark_drained(from).await {
                        let phase = self.state.phase().await;
                        return Ok(self.tag(AgentEvent::eof(), phase));
                    }
                }
            }
        }
    }

    /// Returns false when the round was replaced or the actor has stopped
    async fn mark_drained(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.interrupted {
            return false;
        }
        match inner.round.as_mut() {
            Some(round) if round.generation == generation => {
                round.drained = true;
                true
            }
            _ => false,
        }
    }

    async fn interrupt(&self) -> Result<()> {
        let (round, delegate) = {
            let mut inner = self.inner.lock().await;
            if inner.closed || inner.interrupted {
                return Ok(());
            }
            inner.interrupted = true;
            (inner.round.take(), inner.delegate.clone())
        };

        self.cancel.cancel();
        if let Some(round) = round {
            let _ = round.handle.await;
        }
        drop(self.handoff.lock().await);
        if let Some(delegate) = delegate {
            if let Err(e) = delegate.interrupt().await {
                warn!(state_id = %self.state_id, error = %e, "failed to interrupt delegate");
            }
        }
        self.input_ready.notify_one();
        info!(actor = %self.definition.name, state_id = %self.state_id, "routing actor interrupted");
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        let delegate = self.inner.lock().await.delegate.clone();
        match delegate {
            Some(delegate) => delegate.revert().await,
            None => Ok(()),
        }
    }

    async fn format_history(&self) -> String {
        let delegate = self.inner.lock().await.delegate.clone();
        match delegate {
            Some(delegate) => delegate.format_history().await,
            None => String::new(),
        }
    }

    async fn close_with_error(&self, reason: Option<String>) -> Result<()> {
        let (round, delegate) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            (inner.round.take(), inner.delegate.take())
        };

        self.cancel.cancel();
        if let Some(round) = round {
            let _ = round.handle.await;
        }
        // a delegate still starting up sees `closed` and closes itself
        drop(self.handoff.lock().await);
        self.input_ready.notify_one();

        match &reason {
            Some(reason) => info!(actor = %self.definition.name, state_id = %self.state_id, reason = %reason, "closing routing actor"),
            None => info!(actor = %self.definition.name, state_id = %self.state_id, "closing routing actor"),
        }

        if let Err(e) = self
            .runtime
            .destroy_state(&self.state_id, self.config.archive_on_close)
            .await
        {
            warn!(state_id = %self.state_id, error = %e, "failed to destroy state on close");
        }

        if let Some(delegate) = delegate {
            if let Err(e) = delegate.close_with_error(reason).await {
                warn!(state_id = %self.state_id, error = %e, "failed to close delegate");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Rounds
    // ========================================================================

    async fn run_round(self: Arc<Self>, text: String, cancel: CancellationToken, queue: RoundQueue) {
        let active = {
            let inner = self.inner.lock().await;
            inner
                .delegate
                .clone()
                .map(|delegate| (delegate, inner.delegate_idle))
        };

        let result = match active {
            None => self.fresh_match(&queue).await,
            Some((delegate, idle)) => {
                self.continue_delegation(delegate, idle, text, cancel, &queue)
                    .await
            }
        };

        if let Err(e) = result {
            warn!(actor = %self.definition.name, state_id = %self.state_id, error = %e, "routing round failed");
            queue.send(Err(e)).await;
        }
        queue.finish().await;
    }

    /// No delegate: classify the accumulated input and start the first match
    async fn fresh_match(self: &Arc<Self>, queue: &RoundQueue) -> Result<()> {
        self.state.set_phase(RoutingPhase::Matching).await;
        let input = self.state.input().await;

        let matches = match self.classify(&input).await {
            Ok(matches) => matches,
            Err(e) => {
                self.state.set_phase(RoutingPhase::Idle).await;
                return Err(e);
            }
        };

        if matches.is_empty() {
            debug!(actor = %self.definition.name, state_id = %self.state_id, "no rule matched");
            self.state.set_matches(Vec::new()).await;
            self.state.set_matched(false).await;
            self.state.set_phase(RoutingPhase::Idle).await;
            queue
                .send(Ok(self.tag(AgentEvent::eof(), RoutingPhase::Idle)))
                .await;
            return Ok(());
        }

        self.state.set_matches(matches).await;
        self.state.set_current_index(0).await;
        self.state.set_matched(true).await;
        self.state.set_phase(RoutingPhase::Executing).await;

        if let Err(e) = self.start_current_intent().await {
            self.state.set_phase(RoutingPhase::Idle).await;
            return Err(e);
        }
        self.run_delegate_loop(queue).await
    }

    /// Active delegate: drain it and reclassify concurrently, then reconcile
    async fn continue_delegation(
        self: &Arc<Self>,
        delegate: Arc<ReasoningActor>,
        idle: bool,
        text: String,
        cancel: CancellationToken,
        queue: &RoundQueue,
    ) -> Result<()> {
        let current_rule = self.state.current_intent().await.map(|intent| intent.rule);

        let classification: JoinHandle<Result<Vec<MatchedIntent>>> = {
            let shared = Arc::clone(self);
            let text = text.clone();
            let span = info_span!("classify", state_id = %self.state_id);
            tokio::spawn(
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(ActorError::Cancelled),
                        matches = shared.classify(&text) => matches,
                    }
                }
                .instrument(span),
            )
        };

        let boundary = if idle {
            Boundary::AwaitingInput
        } else {
            self.drain_delegate(&delegate, queue).await?
        };

        let matches = classification
            .await
            .map_err(|e| ActorError::from(anyhow::anyhow!("classification task failed: {}", e)))??;

        match boundary {
            Boundary::AwaitingInput => {
                let switched = matches
                    .first()
                    .is_some_and(|m| Some(&m.rule) != current_rule.as_ref());
                if switched {
                    self.apply_switch(text, matches).await?;
                } else {
                    debug!(
                        actor = %self.definition.name,
                        state_id = %self.state_id,
                        rule = current_rule.as_deref().unwrap_or(""),
                        "no intent switch; forwarding input to delegate"
                    );
                    self.set_delegate_idle(&delegate, false).await;
                    delegate.input(&text).await?;
                }
            }
            Boundary::Finished => {
                self.finish_delegate(&delegate).await;
                if !matches.is_empty() {
                    self.apply_switch(text, matches).await?;
                } else if !self.advance(text).await? {
                    queue
                        .send(Ok(self.tag(AgentEvent::eof(), RoutingPhase::Idle)))
                        .await;
                    return Ok(());
                }
            }
        }

        self.run_delegate_loop(queue).await
    }

    /// Forward the delegate's events up to its round boundary
    async fn drain_delegate(
        self: &Arc<Self>,
        delegate: &Arc<ReasoningActor>,
        queue: &RoundQueue,
    ) -> Result<Boundary> {
        loop {
            match self.pull_delegate(delegate, queue).await? {
                EventKind::Eof => return Ok(Boundary::AwaitingInput),
                EventKind::Closed | EventKind::Interrupted => return Ok(Boundary::Finished),
                _ => {}
            }
        }
    }

    /// Forward the active delegate's events until it needs input, moving on
    /// through the matched intents as delegates finish
    async fn run_delegate_loop(self: &Arc<Self>, queue: &RoundQueue) -> Result<()> {
        loop {
            let Some(delegate) = self.inner.lock().await.delegate.clone() else {
                return Ok(());
            };

            match self.pull_delegate(&delegate, queue).await? {
                EventKind::Closed | EventKind::Interrupted => {
                    self.finish_delegate(&delegate).await;
                    if !self.advance(String::new()).await? {
                        queue
                            .send(Ok(self.tag(AgentEvent::eof(), RoutingPhase::Idle)))
                            .await;
                        return Ok(());
                    }
                }
                EventKind::Eof => {
                    queue
                        .send(Ok(self.tag(AgentEvent::eof(), RoutingPhase::Executing)))
                        .await;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Pull the delegate's next event in a task of its own. The task owns a
    /// queue slot and the handoff lock, so the event is delivered even if the
    /// round is cancelled meanwhile. Forwardable events are queued by the
    /// task; the kind is returned. A delegate that reached `Eof` or failed is
    /// marked idle.
    async fn pull_delegate(
        self: &Arc<Self>,
        delegate: &Arc<ReasoningActor>,
        queue: &RoundQueue,
    ) -> Result<EventKind> {
        let permit = queue.reserve().await?;
        let guard = Arc::clone(&self.handoff).lock_owned().await;
        let shared = Arc::clone(self);
        let delegate = Arc::clone(delegate);
        let generation = queue.generation;

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                match delegate.next().await {
                    Ok(event) => {
                        let kind = event.kind;
                        match kind {
                            EventKind::Eof => shared.set_delegate_idle(&delegate, true).await,
                            EventKind::Closed | EventKind::Interrupted => {}
                            _ => {
                                permit.send((generation, RoundItem::Event(Ok(event))));
                            }
                        }
                        Ok(kind)
                    }
                    Err(e) => {
                        shared.set_delegate_idle(&delegate, true).await;
                        Err(e)
                    }
                }
            }
            .in_current_span(),
        );
        task.await
            .map_err(|e| ActorError::from(anyhow::anyhow!("delegate task failed: {}", e)))?
    }

    // ========================================================================
    // Delegation
    // ========================================================================

    async fn classify(&self, input: &str) -> Result<Vec<MatchedIntent>> {
        let results = self
            .matcher
            .classify(self.runtime.as_ref(), &self.model, input)
            .await?;

        Ok(results
            .into_iter()
            .filter_map(|m| {
                let target = self.routes.get(&m.rule)?.clone();
                Some(MatchedIntent {
                    rule: m.rule,
                    args: m.args,
                    target,
                })
            })
            .collect())
    }

    async fn resolve_delegate(&self, target: &DelegateRef) -> Result<ReasoningDefinition> {
        match target {
            DelegateRef::Inline(def) => Ok(def.as_ref().clone()),
            DelegateRef::Ref { reference } => match self.runtime.get_actor_definition(reference).await? {
                ActorDefinition::Reasoning(def) => Ok(def),
                ActorDefinition::Routing(def) => Err(ActorError::NestedRouting(def.name)),
            },
        }
    }

    /// Start the delegate for the intent at the current index. Startup runs
    /// under the handoff lock in a task of its own, so the delegate is either
    /// registered or closed even when the round is cancelled meanwhile.
    async fn start_current_intent(self: &Arc<Self>) -> Result<()> {
        let guard: OwnedMutexGuard<()> = Arc::clone(&self.handoff).lock_owned().await;
        let shared = Arc::clone(self);
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                shared.launch_delegate().await
            }
            .in_current_span(),
        );
        task.await
            .map_err(|e| ActorError::from(anyhow::anyhow!("delegate startup failed: {}", e)))?
    }

    /// Create the delegate for the current intent and feed it the accumulated input
    async fn launch_delegate(&self) -> Result<()> {
        let Some(intent) = self.state.current_intent().await else {
            return Ok(());
        };
        let definition = self.resolve_delegate(&intent.target).await?;
        let delegate = ReasoningActor::new_delegate(
            Arc::clone(&self.runtime),
            definition,
            &self.state_id,
            &self.cancel,
        )
        .await?;

        let input = self.state.input().await;
        let text = if self.config.annotate_delegate_args && !intent.args.is_empty() {
            format!(
                "{}\n(Extracted args: {})",
                input,
                serde_json::to_string(&intent.args)?
            )
        } else {
            input
        };
        if let Err(e) = delegate.input(&text).await {
            let _ = delegate.close().await;
            return Err(e);
        }

        self.state
            .set_delegate_state(Some(delegate.reasoning_state()))
            .await;

        let delegate = Arc::new(delegate);
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.interrupted {
            drop(inner);
            let _ = delegate.close().await;
            return Err(ActorError::Closed);
        }
        info!(
            actor = %self.definition.name,
            state_id = %self.state_id,
            rule = %intent.rule,
            delegate = %intent.target.name(),
            delegate_state_id = %delegate.state_id(),
            "delegate started"
        );
        inner.delegate = Some(delegate);
        inner.delegate_idle = false;
        Ok(())
    }

    /// Replace the active intents with `matches` for `text` and start the first one.
    /// The previous delegate is closed in the background.
    async fn apply_switch(self: &Arc<Self>, text: String, matches: Vec<MatchedIntent>) -> Result<()> {
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.delegate_idle = false;
            inner.delegate.take()
        };
        if let Some(previous) = previous {
            let span = info_span!("close_delegate", delegate_state_id = %previous.state_id());
            tokio::spawn(
                async move {
                    if let Err(e) = previous.close().await {
                        warn!(error = %e, "failed to close replaced delegate");
                    }
                }
                .instrument(span),
            );
        }

        if let Some(first) = matches.first() {
            info!(
                actor = %self.definition.name,
                state_id = %self.state_id,
                rule = %first.rule,
                "intent switched"
            );
        }
        self.state.set_input(text).await;
        self.state.set_matches(matches).await;
        self.state.set_current_index(0).await;
        self.state.set_matched(true).await;
        self.state.set_phase(RoutingPhase::Executing).await;
        self.state.set_delegate_state(None).await;

        let started = self.start_current_intent().await;
        if started.is_err() {
            self.state.set_phase(RoutingPhase::Idle).await;
        }
        started
    }

    /// Drop the delegate handle (if it is still the active one) and close it
    async fn finish_delegate(&self, delegate: &Arc<ReasoningActor>) {
        {
            let mut inner = self.inner.lock().await;
            if inner
                .delegate
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, delegate))
            {
                inner.delegate = None;
                inner.delegate_idle = false;
            }
        }
        debug!(state_id = %self.state_id, delegate_state_id = %delegate.state_id(), "delegate finished");
        // closing runs to completion even if the round is cancelled
        let closing = {
            let delegate = Arc::clone(delegate);
            let state_id = self.state_id.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = delegate.close().await {
                        warn!(state_id = %state_id, error = %e, "failed to close finished delegate");
                    }
                }
                .in_current_span(),
            )
        };
        self.state.set_delegate_state(None).await;
        let _ = closing.await;
    }

    /// Move to the next matched intent. Returns false when none is left and
    /// the state went back to idle, keeping `leftover` as accumulated input.
    async fn advance(self: &Arc<Self>, leftover: String) -> Result<bool> {
        let index = self.state.current_index().await + 1;
        self.state.set_current_index(index).await;

        if index < self.state.matches().await.len() {
            self.start_current_intent().await?;
            return Ok(true);
        }

        self.state.set_phase(RoutingPhase::Idle).await;
        self.state.set_input(leftover).await;
        self.state.set_matches(Vec::new()).await;
        self.state.set_matched(false).await;
        self.state.set_current_index(0).await;
        self.state.set_delegate_state(None).await;
        debug!(actor = %self.definition.name, state_id = %self.state_id, "all intents handled; back to idle");
        Ok(false)
    }

    async fn set_delegate_idle(&self, delegate: &Arc<ReasoningActor>, idle: bool) {
        let mut inner = self.inner.lock().await;
        if inner
            .delegate
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, delegate))
        {
            inner.delegate_idle = idle;
        }
    }
}

#[async_trait]
impl Actor for RoutingActor {
    fn kind(&self) -> ActorKind {
        ActorKind::Routing
    }

    fn definition(&self) -> ActorDefinition {
        ActorDefinition::Routing(self.shared.definition.clone())
    }

    fn state(&self) -> StateHandle {
        StateHandle::Routing(Arc::clone(&self.shared.state))
    }

    fn state_id(&self) -> &str {
        &self.shared.state_id
    }

    async fn input(&self, content: &str) -> Result<()> {
        self.shared.input(content).await
    }

    async fn interrupt(&self) -> Result<()> {
        self.shared.interrupt().await
    }

    async fn next(&self) -> Result<AgentEvent> {
        self.shared.next().await
    }

    async fn revert(&self) -> Result<()> {
        self.shared.revert().await
    }

    async fn format_history(&self) -> String {
        self.shared.format_history().await
    }

    async fn close_with_error(&self, reason: Option<String>) -> Result<()> {
        self.shared.close_with_error(reason).await
    }
}
