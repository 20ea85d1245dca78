//! `spc-core`: emulator core for the SNES audio subsystem.
//!
//! Ties together the [`memory`] fabric, the three hardware [`timer`]s, the [`dsp`] voice engine,
//! and an [`spc700_emu::Spc700`] CPU into a single owned [`Machine`] value, and drives them
//! through a cooperative scheduler ([`Machine::run_one_iteration`]) that paces sample production
//! to one stereo pair per 64 CPU cycles.
//!
//! Snapshot file parsing, the interactive debugger, the disassembler, and the audio sink are all
//! external collaborators; this crate only consumes an already-parsed [`Snapshot`] and pushes
//! samples through a caller-supplied [`SampleSink`].

pub mod dsp;
pub mod error;
pub mod memory;
pub mod timer;

use crate::dsp::Dsp;
use crate::error::CoreError;
use crate::memory::{AudioRam, IoRegisters};
use bincode::{Decode, Encode};
use spc700_emu::traits::BusInterface;
use spc700_emu::{Registers, Spc700, StatusRegister};

/// One stereo sample pair is produced every 64 SPC700 cycles (2.048 MHz / 32 kHz).
const CYCLES_PER_SAMPLE: u64 = 64;

/// Seam for future runtime options. The sample-rate divider and Gaussian interpolation are fixed
/// by hardware per the spec and are not configurable today, but callers already construct this
/// alongside [`Machine::new`] so a later option (e.g. an interpolation-quality switch) has
/// somewhere to attach without breaking the constructor signature.
#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct Config {}

/// A receiver for the stereo PCM stream the scheduler produces. `push_sample` returns `true` to
/// signal backpressure (the sink's buffer is full); the scheduler surfaces that back to the
/// caller as [`StepOutcome::Backpressure`] rather than blocking internally.
pub trait SampleSink {
    fn push_sample(&mut self, left: i16, right: i16) -> bool;
}

/// The parsed contents of a `.spc` snapshot file. Parsing the file itself (magic bytes, tag
/// fields, header version) is an external collaborator's job; this type is the handoff point.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub pc: u16,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub psw: u8,
    pub ram: Box<[u8; 0x10000]>,
    pub dsp_registers: [u8; 128],
}

/// What happened during one [`Machine::run_one_iteration`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The CPU executed one instruction; zero or more samples may have been produced.
    Ran,
    /// The supplied breakpoint predicate matched the program counter before the instruction was
    /// fetched. Control is handed back to the caller (the debugger collaborator) without the
    /// CPU, timers, or DSP advancing at all.
    Breakpoint,
    /// A sample was produced and the sink signalled backpressure. The caller should idle
    /// briefly before calling `run_one_iteration` again; cycle and sample state already
    /// advanced normally.
    Backpressure,
}

/// The top-level owned value: RAM, the MMIO/timer/DSP register fabric, and the CPU, plus the
/// scheduler's own cycle/sample bookkeeping. Per-instruction and per-sample access to RAM/DSP
/// from the CPU is mediated by a short-lived [`memory::Spc700Bus`] built fresh for the scope of
/// one `step` or `clock` call; nothing here holds a raw pointer or a persistent alias.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Machine {
    cpu: Spc700,
    ram: AudioRam,
    io: IoRegisters,
    dsp: Dsp,
    config: Config,
    cycle: u64,
    next_sample_cycle: u64,
    sample_counter: u64,
}

impl Machine {
    pub fn new(config: Config) -> Self {
        let mut machine = Self {
            cpu: Spc700::new(),
            ram: AudioRam::new(),
            io: IoRegisters::new(),
            dsp: Dsp::new(),
            config,
            cycle: 0,
            next_sample_cycle: CYCLES_PER_SAMPLE,
            sample_counter: 0,
        };
        machine.cpu.reset(&mut new_spc700_bus!(machine));
        machine
    }

    /// Construct a `Machine` from an already-parsed snapshot. This is the sole ingestion point
    /// for snapshot data; there is no file I/O or header validation here, both of which are the
    /// external parser's responsibility.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot, config: Config) -> Self {
        let mut machine = Self {
            cpu: Spc700::new(),
            ram: AudioRam::new(),
            io: IoRegisters::new(),
            dsp: Dsp::new(),
            config,
            cycle: 0,
            next_sample_cycle: CYCLES_PER_SAMPLE,
            sample_counter: 0,
        };

        machine.ram.load(&snapshot.ram);
        machine.cpu.set_registers(Registers {
            a: snapshot.a,
            x: snapshot.x,
            y: snapshot.y,
            sp: snapshot.sp,
            pc: snapshot.pc,
            psw: StatusRegister::from(snapshot.psw),
        });

        // The DSP register file has no out-of-band bulk loader: every byte is replayed through
        // the same address/data latch the CPU uses, so KON/FLG-reset side effects (restarting a
        // voice's decode, soft-resetting the envelope) fire exactly as they would if the SPC700
        // program itself had just written these bytes. Real `.spc` players take the same
        // shortcut, since the file format does not capture in-flight BRR decode state (current
        // block pointer, decoded sample window, envelope phase) for a voice that was already
        // playing when the snapshot was taken -- acceptable per the "audible correctness, not
        // cycle-perfect fidelity" non-goal.
        for (address, &value) in snapshot.dsp_registers.iter().enumerate() {
            machine.dsp.write_address(address as u8);
            machine.dsp.write_register(value);
        }

        machine
    }

    /// Reset the CPU (reading the reset vector from RAM) and the DSP, and rewind the scheduler's
    /// cycle/sample bookkeeping. RAM contents are left untouched.
    pub fn reset(&mut self) {
        self.cpu.reset(&mut new_spc700_bus!(self));
        self.dsp.reset();
        self.cycle = 0;
        self.next_sample_cycle = CYCLES_PER_SAMPLE;
        self.sample_counter = 0;
    }

    #[must_use]
    pub fn config(&self) -> Config {
        self.config
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn sample_counter(&self) -> u64 {
        self.sample_counter
    }

    #[must_use]
    pub fn pc(&self) -> u16 {
        self.cpu.pc()
    }

    /// Direct RAM access for the external debugger/disassembler collaborators (memory dump,
    /// disassembly at an arbitrary address). Not used by the CPU or DSP, which always go through
    /// [`memory::Spc700Bus`] so the MMIO window is observed.
    #[must_use]
    pub fn ram(&self) -> &[u8] {
        self.ram.as_slice()
    }

    /// Run one scheduler iteration: optionally surrender to a breakpoint predicate, otherwise
    /// execute exactly one SPC700 instruction, advance the timers by the cycles it consumed, and
    /// emit any sample(s) now due at the 32 kHz rate. `should_break` is the debugger collaborator's
    /// hook (Section 5's "stop requested" flag is naturally expressed by a predicate that always
    /// returns `true`).
    pub fn run_one_iteration(
        &mut self,
        sink: &mut impl SampleSink,
        mut should_break: impl FnMut(u16) -> bool,
    ) -> Result<StepOutcome, CoreError> {
        if should_break(self.cpu.pc()) {
            return Ok(StepOutcome::Breakpoint);
        }

        let cycles = step_checked(&mut self.cpu, &mut new_spc700_bus!(self))?;
        self.cycle += u64::from(cycles);
        self.io.tick(cycles);

        let mut backpressure = false;
        while self.cycle >= self.next_sample_cycle {
            let (left, right) = self.dsp.clock(self.ram.as_slice());
            self.sample_counter += 1;
            self.next_sample_cycle += CYCLES_PER_SAMPLE;

            if sink.push_sample(left, right) {
                backpressure = true;
            }
        }

        Ok(if backpressure { StepOutcome::Backpressure } else { StepOutcome::Ran })
    }
}

/// Thin wrapping layer over [`Spc700::step`]. The underlying crate's opcode dispatch is
/// exhaustive over all 256 byte values by construction (every byte decodes to some instruction
/// on real SPC700 hardware), so this never actually returns `Err` today; it exists to give the
/// scheduler the typed abort path the design notes call for, and so a future CPU bug (an
/// explicit "this opcode is not implemented" stub, say) has somewhere to surface without
/// changing this function's signature.
fn step_checked<B: BusInterface>(cpu: &mut Spc700, bus: &mut B) -> Result<u32, CoreError> {
    Ok(cpu.step(bus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[derive(Default)]
    struct VecSink {
        samples: Vec<(i16, i16)>,
    }

    impl SampleSink for VecSink {
        fn push_sample(&mut self, left: i16, right: i16) -> bool {
            self.samples.push((left, right));
            false
        }
    }

    fn silent_snapshot() -> Snapshot {
        Snapshot {
            pc: 0x0000,
            a: 0,
            x: 0,
            y: 0,
            sp: 0,
            psw: 0,
            ram: Box::new([0; 0x10000]),
            dsp_registers: {
                let mut regs = [0; 128];
                regs[0x6C] = 0x60; // FLG: mute set, soft reset clear
                regs
            },
        }
    }

    #[test]
    fn silent_snapshot_produces_zero_samples() {
        let mut machine = Machine::from_snapshot(silent_snapshot(), Config::default());
        let mut sink = VecSink::default();

        // RAM is all zero, so every fetched opcode is 0x00 (NOP, 2 cycles): 32 samples at 64
        // cycles/sample need at least 32 * 64 / 2 NOPs worth of iterations.
        for _ in 0..(32 * 64) {
            machine.run_one_iteration(&mut sink, |_| false).unwrap();
            if sink.samples.len() >= 32 {
                break;
            }
        }

        assert!(sink.samples.len() >= 32);
        assert!(sink.samples[..32].iter().all(|&(l, r)| l == 0 && r == 0));
    }

    #[test]
    fn breakpoint_predicate_surrenders_before_executing() {
        let mut machine = Machine::from_snapshot(silent_snapshot(), Config::default());
        let mut sink = VecSink::default();

        let outcome = machine.run_one_iteration(&mut sink, |pc| pc == 0x0000).unwrap();

        assert_eq!(outcome, StepOutcome::Breakpoint);
        assert_eq!(machine.cycle(), 0);
        assert_eq!(machine.pc(), 0x0000);
    }

    #[test]
    fn one_sample_pair_emitted_per_64_cycle_window() {
        let mut machine = Machine::from_snapshot(silent_snapshot(), Config::default());
        let mut sink = VecSink::default();

        for _ in 0..256 {
            machine.run_one_iteration(&mut sink, |_| false).unwrap();
        }

        // NOP costs 2 cycles; over `cycle` cycles at most cycle/64 samples can have fired.
        let max_expected = machine.cycle() / CYCLES_PER_SAMPLE;
        assert!(u64::try_from(sink.samples.len()).unwrap() <= max_expected);
        assert_eq!(u64::try_from(sink.samples.len()).unwrap(), machine.sample_counter());
    }

    #[test]
    fn from_snapshot_loads_cpu_registers_and_ram() {
        let mut snapshot = silent_snapshot();
        snapshot.pc = 0x1234;
        snapshot.a = 0x42;
        snapshot.ram[0x1234] = 0xFF; // STOP, so PC won't move further once fetched

        let machine = Machine::from_snapshot(snapshot, Config::default());
        assert_eq!(machine.pc(), 0x1234);
        assert_eq!(machine.ram()[0x1234], 0xFF);
    }
}
