// Deletion queue
//
// Destructors are pushed as resources are created and run in reverse order,
// so teardown mirrors setup without hand-maintained cleanup lists.
// `unwind_on_error` uses the same queue to undo a constructor that fails
// partway.

use anyhow::Result;

pub struct DeletionQueue<Ctx> {
    queue: Vec<Box<dyn FnOnce(&Ctx)>>,
}

impl<Ctx> Default for DeletionQueue<Ctx> {
    fn default() -> Self {
        Self { queue: Vec::new() }
    }
}

impl<Ctx> DeletionQueue<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, destroy: F)
    where
        F: FnOnce(&Ctx) + 'static,
    {
        self.queue.push(Box::new(destroy));
    }

    /// Run every queued destructor, last pushed first
    pub fn flush(&mut self, ctx: &Ctx) {
        while let Some(destroy) = self.queue.pop() {
            destroy(ctx);
        }
    }

    /// Discard queued destructors without running them
    pub fn dismiss(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<Ctx> Drop for DeletionQueue<Ctx> {
    fn drop(&mut self) {
        if !self.is_empty() {
            log::warn!("Deletion queue dropped with {} pending destructors", self.len());
        }
    }
}

/// Run `create`, which queues a destructor for every object it makes.
/// On error those run last-created first; on success the objects belong to
/// the returned value and the destructors are discarded.
pub fn unwind_on_error<Ctx, T>(
    ctx: &Ctx,
    create: impl FnOnce(&mut DeletionQueue<Ctx>) -> Result<T>,
) -> Result<T> {
    let mut created = DeletionQueue::new();
    let result = create(&mut created);
    if result.is_err() {
        created.flush(ctx);
    } else {
        created.dismiss();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn flush_runs_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        let mut queue = DeletionQueue::new();

        for name in ["instance", "device", "swapchain"] {
            queue.push(move |log: &RefCell<Vec<&str>>| log.borrow_mut().push(name));
        }
        assert_eq!(queue.len(), 3);

        queue.flush(&log);

        assert!(queue.is_empty());
        assert_eq!(*log.borrow(), vec!["swapchain", "device", "instance"]);
    }

    #[test]
    fn flush_twice_runs_each_destructor_once() {
        let count = RefCell::new(0);
        let mut queue = DeletionQueue::new();
        queue.push(|count: &RefCell<i32>| *count.borrow_mut() += 1);

        queue.flush(&count);
        queue.flush(&count);

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn dropping_pending_queue_runs_nothing() {
        let count = Rc::new(Cell::new(0));
        {
            let mut queue = DeletionQueue::<()>::new();
            let counter = count.clone();
            queue.push(move |_| counter.set(counter.get() + 1));
            assert_eq!(queue.len(), 1);
        }
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn failed_creation_destroys_in_reverse() {
        let log = RefCell::new(Vec::new());

        let result: Result<()> = unwind_on_error(&log, |created| {
            created.push(|log: &RefCell<Vec<&str>>| log.borrow_mut().push("image"));
            created.push(|log: &RefCell<Vec<&str>>| log.borrow_mut().push("memory"));
            anyhow::bail!("bind failed")
        });

        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec!["memory", "image"]);
    }

    #[test]
    fn successful_creation_keeps_objects() {
        let log = RefCell::new(Vec::<&str>::new());

        let value = unwind_on_error(&log, |created| {
            created.push(|log: &RefCell<Vec<&str>>| log.borrow_mut().push("semaphore"));
            Ok(7)
        })
        .unwrap();

        assert_eq!(value, 7);
        assert!(log.borrow().is_empty());
    }
}
