//! # Initialization Pipeline
//!
//! Ordered producer/consumer task sequence, run once per new
//! [`Communicator`] before steady-state messaging begins.
//!
//! A producer runs exactly once, synchronously, whenever reached; it
//! never waits for input. A consumer runs only when the inbox holds
//! unread bytes and reports whether it consumed what it needed (`true`
//! advances, `false` suspends until the next read event re-invokes the
//! same task). Any task may carry a condition; a false condition skips
//! the task as instantly complete.
//!
//! Tasks record discoveries (a negotiated UDP port, an authentication
//! outcome) in the run's [`InitializationContext`], visible to every
//! later task of the same run and never shared across Communicators.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::ByteFrame;
use crate::error::{constants, PeermuxError, Result};
use crate::session::communicator::Communicator;

/// Value recorded by an initialization task.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl ContextValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ContextValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Append-only key/value registry accumulated across the tasks of one
/// pipeline run. Entries are never removed.
#[derive(Debug, Default)]
pub struct InitializationContext {
    values: HashMap<String, ContextValue>,
}

impl InitializationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: ContextValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(ContextValue::as_bool)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(ContextValue::as_i32)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ContextValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a task sees while running: the shared context, the session it
/// belongs to, and (for consumers) the read-positioned inbox.
pub struct TaskIo<'a> {
    pub context: &'a mut InitializationContext,
    pub communicator: &'a Arc<Communicator>,
    pub inbox: &'a mut ByteFrame,
}

type ProducerFn = Box<dyn FnMut(&mut TaskIo<'_>) -> Result<()> + Send>;
type ConsumerFn = Box<dyn FnMut(&mut TaskIo<'_>) -> Result<bool> + Send>;
type ConditionFn = Box<dyn Fn(&InitializationContext, &Communicator) -> bool + Send>;

/// One task in the sequence: a tagged kind carrying its closure,
/// dispatched through a single match.
pub enum InitTask {
    Producer {
        condition: Option<ConditionFn>,
        run: ProducerFn,
    },
    Consumer {
        condition: Option<ConditionFn>,
        run: ConsumerFn,
    },
}

impl InitTask {
    fn condition(&self) -> Option<&ConditionFn> {
        match self {
            InitTask::Producer { condition, .. } | InitTask::Consumer { condition, .. } => {
                condition.as_ref()
            }
        }
    }
}

/// Reusable bundle of tasks appended with
/// [`InitializationPipeline::add_config`].
pub trait PipelineConfig {
    fn configure(&self, pipeline: &mut InitializationPipeline);
}

/// Progress of one `resume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// A consumer needs more inbound bytes; re-invoke on the next read.
    Suspended,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Running(usize),
    Complete,
    Failed,
}

/// Ordered task sequence with suspension.
#[derive(Default)]
pub struct InitializationPipeline {
    tasks: Vec<InitTask>,
    state: PipelineState,
}

impl InitializationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add_producer<F>(&mut self, run: F) -> &mut Self
    where
        F: FnMut(&mut TaskIo<'_>) -> Result<()> + Send + 'static,
    {
        self.tasks.push(InitTask::Producer {
            condition: None,
            run: Box::new(run),
        });
        self
    }

    pub fn add_producer_if<C, F>(&mut self, condition: C, run: F) -> &mut Self
    where
        C: Fn(&InitializationContext, &Communicator) -> bool + Send + 'static,
        F: FnMut(&mut TaskIo<'_>) -> Result<()> + Send + 'static,
    {
        self.tasks.push(InitTask::Producer {
            condition: Some(Box::new(condition)),
            run: Box::new(run),
        });
        self
    }

    pub fn add_consumer<F>(&mut self, run: F) -> &mut Self
    where
        F: FnMut(&mut TaskIo<'_>) -> Result<bool> + Send + 'static,
    {
        self.tasks.push(InitTask::Consumer {
            condition: None,
            run: Box::new(run),
        });
        self
    }

    pub fn add_consumer_if<C, F>(&mut self, condition: C, run: F) -> &mut Self
    where
        C: Fn(&InitializationContext, &Communicator) -> bool + Send + 'static,
        F: FnMut(&mut TaskIo<'_>) -> Result<bool> + Send + 'static,
    {
        self.tasks.push(InitTask::Consumer {
            condition: Some(Box::new(condition)),
            run: Box::new(run),
        });
        self
    }

    /// Append every task of a reusable bundle.
    pub fn add_config(&mut self, bundle: &dyn PipelineConfig) -> &mut Self {
        bundle.configure(self);
        self
    }

    /// Convenience: a producer that sends one framed message.
    pub fn send(&mut self, message: Vec<u8>) -> &mut Self {
        self.add_producer(move |io| io.communicator.send(&message))
    }

    /// Convenience: a consumer that parses one value from the inbox and
    /// records it under `key`. The reader returns `Ok(None)` to suspend
    /// until more bytes arrive.
    pub fn receive<F>(&mut self, key: impl Into<String>, mut reader: F) -> &mut Self
    where
        F: FnMut(&mut ByteFrame) -> Result<Option<ContextValue>> + Send + 'static,
    {
        let key = key.into();
        self.add_consumer(move |io| match reader(io.inbox)? {
            Some(value) => {
                io.context.put(key.clone(), value);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    /// Run or resume the sequence. Producers run as reached; a consumer
    /// with an empty inbox (or one returning `false`) suspends the run
    /// at its index. The inbox is compacted after every consumer
    /// invocation so an unread tail survives the suspension.
    ///
    /// A task error marks the pipeline Failed and propagates; the owning
    /// context tears the session down and discards the inbox.
    pub fn resume(
        &mut self,
        context: &mut InitializationContext,
        communicator: &Arc<Communicator>,
        inbox: &mut ByteFrame,
    ) -> Result<PipelineStatus> {
        let mut index = match self.state {
            PipelineState::Idle => 0,
            PipelineState::Running(index) => index,
            PipelineState::Complete | PipelineState::Failed => {
                return Err(PeermuxError::Initialization(
                    constants::ERR_PIPELINE_FINISHED.into(),
                ));
            }
        };

        loop {
            if index >= self.tasks.len() {
                self.state = PipelineState::Complete;
                debug!(tasks = self.tasks.len(), "Pipeline complete");
                return Ok(PipelineStatus::Complete);
            }

            let task = &mut self.tasks[index];
            if let Some(condition) = task.condition() {
                if !condition(context, communicator.as_ref()) {
                    trace!(index, "Task skipped by condition");
                    index += 1;
                    continue;
                }
            }

            match task {
                InitTask::Producer { run, .. } => {
                    let mut io = TaskIo {
                        context,
                        communicator,
                        inbox,
                    };
                    if let Err(cause) = run(&mut io) {
                        self.state = PipelineState::Failed;
                        return Err(cause);
                    }
                    index += 1;
                }
                InitTask::Consumer { run, .. } => {
                    if !inbox.has_remaining() {
                        self.state = PipelineState::Running(index);
                        return Ok(PipelineStatus::Suspended);
                    }
                    let mut io = TaskIo {
                        context,
                        communicator,
                        inbox,
                    };
                    let advanced = run(&mut io);
                    // Preserve the unread tail across any suspension.
                    inbox.compact();
                    inbox.flip();
                    match advanced {
                        Ok(true) => index += 1,
                        Ok(false) => {
                            self.state = PipelineState::Running(index);
                            return Ok(PipelineStatus::Suspended);
                        }
                        Err(cause) => {
                            self.state = PipelineState::Failed;
                            return Err(cause);
                        }
                    }
                }
            }
        }
    }
}
