//! The 64 KiB audio RAM and the memory-mapped I/O window at $00F0-$00FF that exposes the
//! timers, the DSP register file, and the dual-mailbox communication ports to the CPU.

use crate::dsp::Dsp;
use crate::timer::Timer;
use bincode::{Decode, Encode};
use spc700_emu::traits::BusInterface;

const RAM_SIZE: usize = 0x10000;

const IO_BASE: u16 = 0x00F0;
const IO_TEST: u16 = 0x00F0;
const IO_CONTROL: u16 = 0x00F1;
const IO_DSP_ADDR: u16 = 0x00F2;
const IO_DSP_DATA: u16 = 0x00F3;
const IO_PORT0: u16 = 0x00F4;
const IO_PORT1: u16 = 0x00F5;
const IO_PORT2: u16 = 0x00F6;
const IO_PORT3: u16 = 0x00F7;
const IO_UNUSED0: u16 = 0x00F8;
const IO_UNUSED1: u16 = 0x00F9;
const IO_TIMER0_DIV: u16 = 0x00FA;
const IO_TIMER1_DIV: u16 = 0x00FB;
const IO_TIMER2_DIV: u16 = 0x00FC;
const IO_TIMER0_OUT: u16 = 0x00FD;
const IO_TIMER1_OUT: u16 = 0x00FE;
const IO_TIMER2_OUT: u16 = 0x00FF;

#[derive(Debug, Clone, Encode, Decode)]
pub struct AudioRam {
    data: Box<[u8; RAM_SIZE]>,
}

impl AudioRam {
    pub fn new() -> Self {
        Self { data: Box::new([0; RAM_SIZE]) }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn load(&mut self, bytes: &[u8; RAM_SIZE]) {
        self.data = Box::new(*bytes);
    }
}

impl Default for AudioRam {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct IoPorts {
    /// CPU-to-DSP mailbox (written by the host CPU, read by the SPC700 program).
    pub input_ports: [u8; 4],
    /// SPC700-to-host mailbox (written by the SPC700 program, read by the host CPU).
    pub output_ports: [u8; 4],
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct IoRegisters {
    pub timer0: Timer,
    pub timer1: Timer,
    pub timer2: Timer,
    pub ports: IoPorts,
    control: u8,
    test: u8,
    cycle: u64,
}

impl IoRegisters {
    pub fn new() -> Self {
        Self {
            timer0: Timer::new(256),
            timer1: Timer::new(256),
            timer2: Timer::new(32),
            ports: IoPorts::default(),
            control: 0,
            test: 0,
            cycle: 0,
        }
    }

    pub fn tick(&mut self, cycles: u32) {
        self.cycle += u64::from(cycles);
        self.timer0.tick(self.cycle);
        self.timer1.tick(self.cycle);
        self.timer2.tick(self.cycle);
    }

    fn write_control(&mut self, value: u8) {
        self.control = value;

        self.timer0.set_enabled(value & 0x01 != 0, self.cycle, self.timer0.divisor());
        self.timer1.set_enabled(value & 0x02 != 0, self.cycle, self.timer1.divisor());
        self.timer2.set_enabled(value & 0x04 != 0, self.cycle, self.timer2.divisor());

        // Writing 1 to bits 4/5 clears the corresponding input port pair.
        if value & 0x10 != 0 {
            self.ports.input_ports[0] = 0;
            self.ports.input_ports[1] = 0;
        }
        if value & 0x20 != 0 {
            self.ports.input_ports[2] = 0;
            self.ports.input_ports[3] = 0;
        }
    }
}

impl Default for IoRegisters {
    fn default() -> Self {
        Self::new()
    }
}

/// A short-lived view bundling RAM, the MMIO registers, and the DSP into the single address
/// space the SPC700 sees. Constructed for the duration of one CPU step and then dropped; there
/// is no owner of multiple mutable references outliving that scope.
pub struct Spc700Bus<'a> {
    pub ram: &'a mut AudioRam,
    pub io: &'a mut IoRegisters,
    pub dsp: &'a mut Dsp,
}

impl BusInterface for Spc700Bus<'_> {
    fn read(&mut self, address: u16) -> u8 {
        match address {
            IO_TEST => self.io.test,
            IO_CONTROL => self.io.control,
            IO_DSP_ADDR => self.dsp.read_address(),
            IO_DSP_DATA => self.dsp.read_register(),
            IO_PORT0 => self.io.ports.input_ports[0],
            IO_PORT1 => self.io.ports.input_ports[1],
            IO_PORT2 => self.io.ports.input_ports[2],
            IO_PORT3 => self.io.ports.input_ports[3],
            IO_UNUSED0 | IO_UNUSED1 => 0,
            IO_TIMER0_DIV => self.io.timer0.divisor(),
            IO_TIMER1_DIV => self.io.timer1.divisor(),
            IO_TIMER2_DIV => self.io.timer2.divisor(),
            IO_TIMER0_OUT => self.io.timer0.read_output(),
            IO_TIMER1_OUT => self.io.timer1.read_output(),
            IO_TIMER2_OUT => self.io.timer2.read_output(),
            _ => self.ram.data[address as usize],
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        match address {
            IO_TEST => self.io.test = value,
            IO_CONTROL => self.io.write_control(value),
            IO_DSP_ADDR => self.dsp.write_address(value),
            IO_DSP_DATA => self.dsp.write_register(value),
            IO_PORT0 => self.io.ports.output_ports[0] = value,
            IO_PORT1 => self.io.ports.output_ports[1] = value,
            IO_PORT2 => self.io.ports.output_ports[2] = value,
            IO_PORT3 => self.io.ports.output_ports[3] = value,
            IO_UNUSED0 | IO_UNUSED1 => {}
            IO_TIMER0_DIV => self.io.timer0.set_divisor(value),
            IO_TIMER1_DIV => self.io.timer1.set_divisor(value),
            IO_TIMER2_DIV => self.io.timer2.set_divisor(value),
            IO_TIMER0_OUT | IO_TIMER1_OUT | IO_TIMER2_OUT => {
                log::warn!("Write to read-only timer output register ${address:04X}");
            }
            _ => self.ram.data[address as usize] = value,
        }
    }

    fn idle(&mut self) {}
}

/// Constructs a [`Spc700Bus`] borrowing the three pieces of a [`crate::Machine`] for the scope
/// of the expression it wraps, mirroring the construction pattern used elsewhere for borrowing
/// a handful of sibling fields into one trait object without a persistent alias.
#[macro_export]
macro_rules! new_spc700_bus {
    ($machine:expr) => {
        $crate::memory::Spc700Bus { ram: &mut $machine.ram, io: &mut $machine.io, dsp: &mut $machine.dsp }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn unmapped_address_falls_through_to_ram() {
        let mut ram = AudioRam::new();
        let mut io = IoRegisters::new();
        let mut dsp = Dsp::new();
        let mut bus = Spc700Bus { ram: &mut ram, io: &mut io, dsp: &mut dsp };

        bus.write(0x0200, 0x42);
        assert_eq!(bus.read(0x0200), 0x42);
    }

    #[test]
    fn dsp_register_window_round_trips_through_address_latch() {
        let mut ram = AudioRam::new();
        let mut io = IoRegisters::new();
        let mut dsp = Dsp::new();
        let mut bus = Spc700Bus { ram: &mut ram, io: &mut io, dsp: &mut dsp };

        bus.write(IO_DSP_ADDR, 0x0C);
        bus.write(IO_DSP_DATA, 0x50);
        assert_eq!(bus.read(IO_DSP_ADDR), 0x0C);
        assert_eq!(bus.read(IO_DSP_DATA), 0x50);
    }

    #[test]
    fn control_register_enables_timers() {
        let mut ram = AudioRam::new();
        let mut io = IoRegisters::new();
        let mut dsp = Dsp::new();
        let mut bus = Spc700Bus { ram: &mut ram, io: &mut io, dsp: &mut dsp };

        bus.write(IO_TIMER0_DIV, 4);
        bus.write(IO_CONTROL, 0x01);

        let mut cycle = 0_u64;
        for _ in 0..(4 * 256) {
            cycle += 1;
            bus.io.timer0.tick(cycle);
        }
        assert_eq!(bus.read(IO_TIMER0_OUT), 1);
    }

    #[test]
    fn control_register_clear_bits_zero_input_ports() {
        let mut ram = AudioRam::new();
        let mut io = IoRegisters::new();
        let mut dsp = Dsp::new();
        io.ports.input_ports = [1, 2, 3, 4];
        let mut bus = Spc700Bus { ram: &mut ram, io: &mut io, dsp: &mut dsp };

        bus.write(IO_CONTROL, 0x10);
        assert_eq!(bus.io.ports.input_ports, [0, 0, 3, 4]);
    }
}
