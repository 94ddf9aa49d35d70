//! Eat-what-you-kill execution strategy (spec §4.3): the thread that just
//! produced a task hands off the "produce next" duty to the executor and
//! then runs the task it produced itself, rather than handing the task
//! off and continuing to produce.

use std::sync::{Arc, Mutex};

use crate::endpoint::Task;
use crate::manager::Manager;
use crate::producer::Producer;

pub(crate) struct EatWhatYouKill<M: Manager> {
    manager: Arc<M>,
    producer: Mutex<Producer<M>>,
}

impl<M: Manager + 'static> EatWhatYouKill<M> {
    pub fn new(manager: Arc<M>, producer: Producer<M>) -> Arc<Self> {
        Arc::new(EatWhatYouKill {
            manager,
            producer: Mutex::new(producer),
        })
    }

    /// Hands the produce/execute loop to the executor. Called once by
    /// `start`, and once more by every tick that produces a task, so that
    /// producing continues while this thread eats the task it just
    /// produced (spec §8, S1: "the producer has been handed to the
    /// executor exactly once" when nothing is ever produced).
    pub fn dispatch(self: &Arc<Self>) {
        let strategy = self.clone();
        let task: Task = Box::new(move || strategy.run());
        if let Err(task) = self.manager.executor().submit(task) {
            drop(task);
        }
    }

    fn run(self: Arc<Self>) {
        let task = {
            let mut producer = self.producer.lock().unwrap();
            producer.produce()
        };
        let Some(task) = task else {
            // The producer has stopped for good; nothing left to hand off.
            return;
        };
        self.dispatch();
        task();
    }
}
