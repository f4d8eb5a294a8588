// CPU/GPU synchronization
//
// One timeline semaphore plays the role of a monotonically increasing fence:
// the queue signals a target value after submitted work, the CPU blocks until
// the counter reaches it. The ledger mirrors the signaled/completed pair so
// the frame loop can check its reset invariant without touching the driver.

use ash::vk;

use crate::error::{Result, VkResultExt};

/// Pure bookkeeping for the fence counter. `signaled` is the last value handed
/// to the queue, `completed` the highest value the CPU has observed finished.
#[derive(Debug, Default, Clone, Copy)]
pub struct FenceLedger {
    signaled: u64,
    completed: u64,
}

impl FenceLedger {
    /// Advance to the next target value to be signaled on the queue.
    pub fn next_value(&mut self) -> u64 {
        self.signaled += 1;
        self.signaled
    }

    pub fn mark_completed(&mut self, value: u64) {
        self.completed = self.completed.max(value);
    }

    pub fn signaled(&self) -> u64 {
        self.signaled
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// True when every value handed to the queue has been observed complete.
    /// The command allocator may only be reset while this holds.
    pub fn idle(&self) -> bool {
        self.completed >= self.signaled
    }
}

/// Timeline-semaphore fence owned by the device for the process lifetime.
pub struct TimelineFence {
    semaphore: vk::Semaphore,
    ledger: FenceLedger,
}

impl TimelineFence {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.create_semaphore(&create_info, None) }
            .api("vkCreateSemaphore(timeline)")?;

        Ok(Self {
            semaphore,
            ledger: FenceLedger::default(),
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn ledger(&self) -> &FenceLedger {
        &self.ledger
    }

    /// Reserve the next fence value; the caller must signal it on the queue.
    pub fn begin_signal(&mut self) -> u64 {
        self.ledger.next_value()
    }

    /// Block until the counter reaches `value`. All queue work submitted
    /// before the corresponding signal is then guaranteed finished.
    pub fn wait(&mut self, device: &ash::Device, value: u64) -> Result<()> {
        if self.ledger.completed() >= value {
            return Ok(());
        }

        let current = unsafe { device.get_semaphore_counter_value(self.semaphore) }
            .api("vkGetSemaphoreCounterValue")?;
        if current < value {
            let semaphores = [self.semaphore];
            let values = [value];
            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semaphores)
                .values(&values);
            unsafe { device.wait_semaphores(&wait_info, u64::MAX) }.api("vkWaitSemaphores")?;
        }
        self.ledger.mark_completed(value);
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.semaphore, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_starts_idle() {
        let ledger = FenceLedger::default();
        assert!(ledger.idle());
        assert_eq!(ledger.signaled(), 0);
    }

    #[test]
    fn ledger_values_are_monotonic() {
        let mut ledger = FenceLedger::default();
        assert_eq!(ledger.next_value(), 1);
        assert_eq!(ledger.next_value(), 2);
        assert_eq!(ledger.next_value(), 3);
    }

    #[test]
    fn reset_forbidden_while_signal_outstanding() {
        let mut ledger = FenceLedger::default();
        let value = ledger.next_value();
        assert!(!ledger.idle());

        ledger.mark_completed(value);
        assert!(ledger.idle());
    }

    #[test]
    fn stale_completion_does_not_regress() {
        let mut ledger = FenceLedger::default();
        let first = ledger.next_value();
        let second = ledger.next_value();
        ledger.mark_completed(second);
        ledger.mark_completed(first);
        assert_eq!(ledger.completed(), second);
        assert!(ledger.idle());
    }
}
