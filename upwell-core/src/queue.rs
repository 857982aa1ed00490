//! Single-consumer FIFO between the sync layer and the UI.
//!
//! Items pushed while nobody listens are buffered. Attaching a consumer
//! drains the backlog into it synchronously, in order.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::oneshot;

use crate::error::{Result, UpwellError};

enum Consumer<T> {
    Every(Box<dyn FnMut(T) + Send>),
    Once(Box<dyn FnOnce(T) + Send>),
}

pub struct TransactionQueue<T> {
    name: String,
    backlog: VecDeque<T>,
    consumer: Option<Consumer<T>>,
}

impl<T> fmt::Debug for TransactionQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("name", &self.name)
            .field("backlog", &self.backlog.len())
            .field("subscribed", &self.consumer.is_some())
            .finish()
    }
}

impl<T: Send + 'static> TransactionQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backlog: VecDeque::new(),
            consumer: None,
        }
    }

    /// Deliver `item` to the consumer, or buffer it.
    pub fn push(&mut self, item: T) {
        match self.consumer.take() {
            None => self.backlog.push_back(item),
            Some(Consumer::Every(mut consumer)) => {
                consumer(item);
                self.consumer = Some(Consumer::Every(consumer));
            }
            Some(Consumer::Once(consumer)) => consumer(item),
        }
    }

    /// Attach the sole consumer and drain the backlog into it.
    pub fn subscribe<F>(&mut self, consumer: F) -> Result<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.ensure_free()?;
        let mut consumer = consumer;
        while let Some(item) = self.backlog.pop_front() {
            consumer(item);
        }
        self.consumer = Some(Consumer::Every(Box::new(consumer)));
        Ok(())
    }

    /// Attach a consumer that detaches itself after one item.
    pub fn once<F>(&mut self, consumer: F) -> Result<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.ensure_free()?;
        match self.backlog.pop_front() {
            Some(item) => consumer(item),
            None => self.consumer = Some(Consumer::Once(Box::new(consumer))),
        }
        Ok(())
    }

    /// Resolve with the next item.
    pub fn first(&mut self) -> Result<oneshot::Receiver<T>> {
        let (tx, rx) = oneshot::channel();
        self.once(move |item| {
            let _ = tx.send(item);
        })?;
        Ok(rx)
    }

    pub fn unsubscribe(&mut self) {
        self.consumer = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.consumer.is_some()
    }

    /// Buffered items.
    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    fn ensure_free(&self) -> Result<()> {
        if self.consumer.is_some() {
            return Err(UpwellError::MultipleSubscribers(self.name.clone()));
        }
        Ok(())
    }
}
