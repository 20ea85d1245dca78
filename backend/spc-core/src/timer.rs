//! The three SPC700 hardware timers. Each is an independent pre-divider feeding a 4-bit output
//! counter, clocked from the shared CPU cycle counter rather than its own clock line.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Encode, Decode)]
pub struct Timer {
    period: u32,
    enabled: bool,
    next_tick_cycle: u64,
    divisor: u8,
    pre_divider: u8,
    output: u8,
}

impl Timer {
    pub fn new(period: u32) -> Self {
        Self { period, enabled: false, next_tick_cycle: 0, divisor: 0, pre_divider: 0, output: 0 }
    }

    /// Advance this timer given the global cycle counter has just reached `current_cycle`.
    pub fn tick(&mut self, current_cycle: u64) {
        if !self.enabled {
            return;
        }

        while current_cycle >= self.next_tick_cycle {
            self.next_tick_cycle += u64::from(self.period);
            self.clock();
        }
    }

    fn clock(&mut self) {
        let latched_divisor = if self.divisor == 0 { 256 } else { u16::from(self.divisor) };

        self.pre_divider = self.pre_divider.wrapping_add(1);
        if u16::from(self.pre_divider) >= latched_divisor {
            self.pre_divider = 0;
            self.output = (self.output + 1) & 0x0F;
        }
    }

    pub fn set_enabled(&mut self, enabled: bool, current_cycle: u64, divisor: u8) {
        self.enabled = enabled;
        if enabled {
            self.divisor = divisor;
            self.pre_divider = 0;
            self.output = 0;
            self.next_tick_cycle = current_cycle + u64::from(self.period);
        } else {
            self.divisor = 0;
            self.pre_divider = 0;
            self.output = 0;
            self.next_tick_cycle = 0;
        }
    }

    pub fn set_divisor(&mut self, divisor: u8) {
        self.divisor = divisor;
    }

    pub fn divisor(&self) -> u8 {
        self.divisor
    }

    /// Read the output counter, clearing it to 0 as a side effect.
    pub fn read_output(&mut self) -> u8 {
        let output = self.output;
        self.output = 0;
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn timer_divisor_zero_behaves_as_256() {
        let mut timer = Timer::new(256);
        timer.set_enabled(true, 0, 0x00);

        let mut cycle = 0_u64;
        for _ in 0..255 {
            cycle += 256;
            timer.tick(cycle);
            assert_eq!(timer.read_output(), 0);
        }
        cycle += 256;
        timer.tick(cycle);
        assert_eq!(timer.read_output(), 1);
    }

    #[test]
    fn output_read_clears_to_zero() {
        let mut timer = Timer::new(256);
        timer.set_enabled(true, 0, 0x01);
        timer.tick(256);

        assert_eq!(timer.read_output(), 1);
        assert_eq!(timer.read_output(), 0);
    }

    #[test]
    fn disabled_timer_does_not_advance() {
        let mut timer = Timer::new(256);
        timer.set_enabled(true, 0, 0x01);
        timer.set_enabled(false, 0, 0x01);

        timer.tick(100_000);
        assert_eq!(timer.read_output(), 0);
    }
}
