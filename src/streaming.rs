//! Streaming aggregation
//!
//! Completion services stream a response as a sequence of batches, each batch
//! holding one [`StreamingChatMessageContent`] delta per choice. This module
//! folds those deltas back into finalized messages.
//!
//! # Combining two chunks
//!
//! [`combine`] merges `b` into `a`, in that order:
//!
//! - `choice_index`, model id, and `encoding` must match; role must match
//!   when both sides carry one. Otherwise [`Error::IncompatibleChunk`].
//! - Text concatenates, an absent side counting as empty.
//! - `finish_reason` is first-wins.
//! - Tool-call fragments accrete by call id:
//!
//! ```text
//! a.tool_calls: [{id: "call_1", name: "math-Add", args: "{\"a\""}]
//! b.tool_calls: [{id: None,                       args: ": 2}"}]
//!                      │ no id: append to the most recent call
//!                      ▼
//! result:       [{id: "call_1", name: "math-Add", args: "{\"a\": 2}"}]
//! ```
//!
//! A fragment with a known id appends to that call, a fragment with a new id
//! starts a new call, and the final list keeps first-appearance order.
//!
//! Chunks must be combined in arrival order. Concatenation is not commutative.

use crate::contents::{ChatMessageContent, FunctionCallContent, StreamingChatMessageContent};
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use std::collections::BTreeMap;

/// Combine two chunks of the same choice, `a` first.
pub fn combine(
    a: StreamingChatMessageContent,
    b: StreamingChatMessageContent,
) -> Result<StreamingChatMessageContent> {
    a.combine(b)
}

impl StreamingChatMessageContent {
    /// Merge a later chunk into this one. See the [module docs](crate::streaming).
    pub fn combine(mut self, other: StreamingChatMessageContent) -> Result<Self> {
        if self.choice_index != other.choice_index {
            return Err(Error::incompatible_chunk(format!(
                "cannot combine choice index {} with choice index {}",
                self.choice_index, other.choice_index
            )));
        }
        if self.ai_model_id != other.ai_model_id {
            return Err(Error::incompatible_chunk(format!(
                "cannot combine chunks from model {:?} and model {:?}",
                self.ai_model_id, other.ai_model_id
            )));
        }
        if self.encoding != other.encoding {
            return Err(Error::incompatible_chunk(format!(
                "cannot combine {:?} chunk with {:?} chunk",
                self.encoding, other.encoding
            )));
        }
        if let (Some(a), Some(b)) = (self.role, other.role) {
            if a != b {
                return Err(Error::incompatible_chunk(format!(
                    "cannot combine {} chunk with {} chunk",
                    a, b
                )));
            }
        }

        self.content = match (self.content, other.content) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or_default() + b.as_deref().unwrap_or("")),
        };
        self.role = self.role.or(other.role);
        self.ai_model_id = self.ai_model_id.or(other.ai_model_id);
        self.finish_reason = self.finish_reason.or(other.finish_reason);

        for (key, value) in other.metadata {
            self.metadata.entry(key).or_insert(value);
        }

        for fragment in other.tool_calls {
            accrete_tool_call(&mut self.tool_calls, fragment);
        }

        Ok(self)
    }
}

/// Fold one tool-call fragment into the running list.
fn accrete_tool_call(calls: &mut Vec<FunctionCallContent>, fragment: FunctionCallContent) {
    let target = match &fragment.id {
        Some(id) => calls.iter().position(|c| c.id.as_deref() == Some(id.as_str())),
        // Providers that interleave parallel calls tag fragments with an index
        None => fragment
            .index
            .and_then(|idx| calls.iter().rposition(|c| c.index == Some(idx)))
            .or_else(|| calls.len().checked_sub(1)),
    };

    match target {
        Some(pos) => calls[pos].merge(fragment),
        None => calls.push(fragment),
    }
}

/// Running aggregation of a streamed response, one entry per choice.
#[derive(Debug, Default)]
pub struct StreamingAggregator {
    choices: BTreeMap<u32, StreamingChatMessageContent>,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the running result for its choice.
    pub fn push(&mut self, chunk: StreamingChatMessageContent) -> Result<()> {
        let index = chunk.choice_index;
        let merged = match self.choices.remove(&index) {
            Some(running) => running.combine(chunk)?,
            None => chunk,
        };
        self.choices.insert(index, merged);
        Ok(())
    }

    /// Fold a whole batch (one delta per choice) in order.
    pub fn push_batch(&mut self, batch: Vec<StreamingChatMessageContent>) -> Result<()> {
        for chunk in batch {
            self.push(chunk)?;
        }
        Ok(())
    }

    /// Running result for a choice, if any chunk arrived for it.
    pub fn get(&self, choice_index: u32) -> Option<&StreamingChatMessageContent> {
        self.choices.get(&choice_index)
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    /// Finalize into one message per choice, ordered by choice index.
    pub fn finish(self) -> Vec<ChatMessageContent> {
        self.choices
            .into_values()
            .map(StreamingChatMessageContent::into_message)
            .collect()
    }
}

/// Drain a streamed response and finalize it.
pub async fn aggregate_stream<S>(stream: S) -> Result<Vec<ChatMessageContent>>
where
    S: Stream<Item = Result<Vec<StreamingChatMessageContent>>>,
{
    let mut aggregator = StreamingAggregator::new();
    futures::pin_mut!(stream);
    while let Some(batch) = stream.next().await {
        aggregator.push_batch(batch?)?;
    }
    Ok(aggregator.finish())
}
