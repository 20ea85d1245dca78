//! S-DSP: the 8-voice ADPCM playback engine. Decodes BRR-compressed blocks, interpolates them to
//! arbitrary pitches, shapes them with per-voice ADSR/GAIN envelopes, and mixes them to stereo.

mod tables;

use bincode::{Decode, Encode};
use jgenesis_common::num::GetBit;
use std::array;

const BRR_BLOCK_LEN: u16 = 9;
const BRR_SAMPLES_PER_BLOCK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
enum EnvelopeMode {
    Adsr,
    #[default]
    Gain,
}

impl EnvelopeMode {
    fn from_bit(bit: bool) -> Self {
        if bit { Self::Adsr } else { Self::Gain }
    }

    fn to_bit(self) -> bool {
        self == Self::Adsr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
enum GainMode {
    #[default]
    Direct,
    Custom,
}

impl GainMode {
    fn from_bit(bit: bool) -> Self {
        if bit { Self::Custom } else { Self::Direct }
    }

    fn to_bit(self) -> bool {
        self == Self::Custom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
enum EnvelopePhase {
    Attack,
    Decay,
    Sustain,
    #[default]
    Release,
}

#[derive(Debug, Clone, Default, Encode, Decode)]
struct Voice {
    // Registers
    instrument_number: u8,
    pitch: u16,
    last_pitch_h_write: u8,
    envelope_mode: EnvelopeMode,
    attack_rate: u8,
    decay_rate: u8,
    sustain_rate: u8,
    sustain_level: u8,
    gain_mode: GainMode,
    gain_value: u8,
    volume_l: i8,
    volume_r: i8,
    keyed_on: bool,
    keyed_off: bool,

    // State
    enabled: bool,
    cur_addr: u16,
    brr_samples: [i16; BRR_SAMPLES_PER_BLOCK],
    brr_loop_flag: bool,
    brr_last_flag: bool,
    prev_brr: [i16; 2],
    prev_interp: [i16; 3],
    pitch_counter: u32,
    envelope_phase: EnvelopePhase,
    envelope_level: u16,
    current_sample: i16,
    restart_pending: bool,
    restart_delay_remaining: u8,
    end_flag_seen: bool,
}

impl Voice {
    fn write_pitch_low(&mut self, value: u8) {
        self.pitch = (self.pitch & 0xFF00) | u16::from(value);
    }

    fn write_pitch_high(&mut self, value: u8) {
        // Pitch is 14 bits; drop the highest 2.
        self.pitch = (self.pitch & 0x00FF) | (u16::from(value & 0x3F) << 8);
        self.last_pitch_h_write = value;
    }

    fn write_adsr_low(&mut self, value: u8) {
        self.attack_rate = value & 0x0F;
        self.decay_rate = (value >> 4) & 0x07;
        self.envelope_mode = EnvelopeMode::from_bit(value.bit(7));
    }

    fn read_adsr_low(&self) -> u8 {
        self.attack_rate | (self.decay_rate << 4) | (u8::from(self.envelope_mode.to_bit()) << 7)
    }

    fn write_adsr_high(&mut self, value: u8) {
        self.sustain_rate = value & 0x1F;
        self.sustain_level = value >> 5;
    }

    fn read_adsr_high(&self) -> u8 {
        self.sustain_rate | (self.sustain_level << 5)
    }

    fn write_gain(&mut self, value: u8) {
        self.gain_mode = GainMode::from_bit(value.bit(7));
        self.gain_value = value & 0x7F;
    }

    fn read_gain(&self) -> u8 {
        self.gain_value | (u8::from(self.gain_mode.to_bit()) << 7)
    }

    fn read_envelope(&self) -> u8 {
        // VxENVX returns the highest 7 bits of the 11-bit envelope value.
        (self.envelope_level >> 4) as u8
    }

    fn read_output(&self) -> u8 {
        (self.current_sample >> 8 & 0x0F) as u8
    }

    fn write_key_on(&mut self, key_on: bool) {
        self.keyed_on = key_on;
        if key_on {
            self.envelope_phase = EnvelopePhase::Attack;
            self.envelope_level = 0;
            self.restart_pending = true;
        }
    }

    fn write_key_off(&mut self, key_off: bool) {
        self.keyed_off = key_off;
        if key_off {
            self.envelope_phase = EnvelopePhase::Release;
        }
    }

    /// FLG bit 7 (soft reset): key off every voice and silence it immediately.
    fn soft_reset(&mut self) {
        self.write_key_off(true);
        self.envelope_level = 0;
    }

    fn clock(&mut self, sample_table_address: u16, ram: &[u8], global_counter: u16) {
        if self.restart_pending {
            self.restart_pending = false;
            self.restart(sample_table_address, ram);
        }

        if self.restart_delay_remaining != 0 {
            self.current_sample = 0;
            self.restart_delay_remaining -= 1;
            if self.restart_delay_remaining == 0 {
                self.decode_block(ram);
            }
            return;
        }

        if !self.enabled {
            self.current_sample = 0;
            return;
        }

        self.pitch_counter += u32::from(self.pitch);
        if self.pitch_counter >= 0x10000 {
            self.pitch_counter -= 0x10000;
            self.advance_block(sample_table_address, ram);
        }

        if !self.enabled {
            self.current_sample = 0;
            return;
        }

        let brr_index = ((self.pitch_counter >> 12) & 0xF) as usize;
        let interp_index = ((self.pitch_counter >> 4) & 0xFF) as usize;
        let sample = self.brr_samples[brr_index];

        let interpolated = gaussian_interpolate(
            interp_index,
            self.prev_interp[0],
            self.prev_interp[1],
            self.prev_interp[2],
            sample,
        );

        self.prev_interp[0] = self.prev_interp[1];
        self.prev_interp[1] = self.prev_interp[2];
        self.prev_interp[2] = sample;

        self.clock_envelope(global_counter);

        let shaped = ((i32::from(interpolated) * i32::from(self.envelope_level)) >> 11) as i16;
        self.current_sample = shaped;

        if self.envelope_level == 0 && self.envelope_phase == EnvelopePhase::Release {
            self.enabled = false;
        }
    }

    fn restart(&mut self, sample_table_address: u16, ram: &[u8]) {
        let table_addr =
            sample_table_address.wrapping_add(u16::from(self.instrument_number) << 2) as usize;
        let start_addr = u16::from_le_bytes([ram[table_addr], ram[table_addr + 1]]);

        self.enabled = true;
        self.cur_addr = start_addr;
        self.pitch_counter = 0;
        self.prev_brr = [0, 0];
        self.prev_interp = [0, 0, 0];
        self.end_flag_seen = false;

        // A handful of empty samples elapse while the first block decodes, mirroring the real
        // DSP's decode pipeline latency.
        self.restart_delay_remaining = 5;
    }

    fn decode_block(&mut self, ram: &[u8]) {
        let header = ram[self.cur_addr as usize];
        let shift = header >> 4;
        let filter = (header >> 2) & 0x03;
        self.brr_loop_flag = header.bit(1);
        self.brr_last_flag = header.bit(0);

        let mut older = self.prev_brr[0];
        let mut old = self.prev_brr[1];
        for i in 0..BRR_SAMPLES_PER_BLOCK {
            let byte_addr = self.cur_addr.wrapping_add(1 + (i / 2) as u16);
            let byte = ram[byte_addr as usize];
            let nibble = if i % 2 == 0 { (byte as i8) >> 4 } else { ((byte as i8) << 4) >> 4 };

            let shifted = apply_brr_shift(nibble, shift);
            let sample = apply_brr_filter(shifted, filter, old, older);
            self.brr_samples[i] = sample;

            older = old;
            old = sample;
        }
        self.prev_brr = [older, old];
    }

    /// Consume the current block's end-of-block bookkeeping and move to the next one.
    fn advance_block(&mut self, sample_table_address: u16, ram: &[u8]) {
        if self.brr_last_flag {
            self.end_flag_seen = true;

            if self.brr_loop_flag {
                let table_addr = sample_table_address
                    .wrapping_add(u16::from(self.instrument_number) << 2)
                    as usize;
                self.cur_addr = u16::from_le_bytes([ram[table_addr + 2], ram[table_addr + 3]]);
                self.decode_block(ram);
            } else {
                self.envelope_phase = EnvelopePhase::Release;
                self.envelope_level = 0;
                self.enabled = false;
            }
        } else {
            self.cur_addr = self.cur_addr.wrapping_add(BRR_BLOCK_LEN);
            self.decode_block(ram);
        }
    }

    fn clock_envelope(&mut self, global_counter: u16) {
        if self.envelope_phase == EnvelopePhase::Release {
            self.envelope_level = self.envelope_level.saturating_sub(8);
            return;
        }

        if self.envelope_phase == EnvelopePhase::Attack && self.envelope_level >= 0x7E0 {
            self.envelope_phase = EnvelopePhase::Decay;
        }

        if self.envelope_phase == EnvelopePhase::Decay {
            let sustain_threshold = u16::from(self.sustain_level + 1) << 8;
            if self.envelope_level <= sustain_threshold {
                self.envelope_phase = EnvelopePhase::Sustain;
            }
        }

        let current_value: i32 = self.envelope_level.into();

        if self.envelope_mode == EnvelopeMode::Gain && self.gain_mode == GainMode::Direct {
            self.envelope_level = (u16::from(self.gain_value) << 4).min(0x7FF);
            return;
        }

        let (rate, step) = match self.envelope_mode {
            EnvelopeMode::Gain => {
                let rate = self.gain_value & 0x1F;
                let step = match self.gain_value & 0x60 {
                    0x00 => -32,
                    0x20 => compute_exp_decay(current_value),
                    0x40 => 32,
                    0x60 => {
                        if current_value < 1536 {
                            32
                        } else {
                            8
                        }
                    }
                    _ => unreachable!("value & 0x60 is always one of the above"),
                };
                (rate, step)
            }
            EnvelopeMode::Adsr => match self.envelope_phase {
                EnvelopePhase::Attack => {
                    let rate = (self.attack_rate << 1) | 0x01;
                    let step = if rate == 31 { 1024 } else { 32 };
                    (rate, step)
                }
                EnvelopePhase::Decay => {
                    let rate = 0x10 | (self.decay_rate << 1);
                    (rate, compute_exp_decay(current_value))
                }
                EnvelopePhase::Sustain => (self.sustain_rate, compute_exp_decay(current_value)),
                EnvelopePhase::Release => (31, -8),
            },
        };

        if tables::rate_fires(rate, global_counter) {
            let new_value = current_value + step;
            self.envelope_level = new_value.clamp(0, 0x7FF) as u16;
        }
    }
}

fn apply_brr_shift(nibble: i8, shift: u8) -> i16 {
    match shift {
        0 => (nibble >> 1).into(),
        1..=12 => i16::from(nibble) << (shift - 1),
        13..=15 => {
            if nibble < 0 {
                -2048
            } else {
                0
            }
        }
        _ => unreachable!("shift is a 4-bit value"),
    }
}

fn apply_brr_filter(sample: i16, filter: u8, old: i16, older: i16) -> i16 {
    let sample: i32 = sample.into();
    let old: i32 = old.into();
    let older: i32 = older.into();

    let filtered = match filter {
        0 => sample,
        1 => sample + old + (-old >> 4),
        2 => sample + (old << 1) + (-(3 * old) >> 5) - older + (older >> 4),
        3 => sample + (old << 1) + (-(13 * old) >> 6) - older + ((3 * older) >> 4),
        _ => unreachable!("filter is a 2-bit value"),
    };

    let clamped = filtered.clamp(i16::MIN.into(), i16::MAX.into()) as i16;
    // Clip to 15 bits.
    (clamped << 1) >> 1
}

fn compute_exp_decay(current_value: i32) -> i32 {
    -(((current_value - 1) >> 8) + 1)
}

fn gaussian_interpolate(interp_index: usize, p0: i16, p1: i16, p2: i16, sample: i16) -> i16 {
    let p0: i32 = p0.into();
    let p1: i32 = p1.into();
    let p2: i32 = p2.into();
    let sample: i32 = sample.into();

    let table = tables::GAUSSIAN_TABLE;
    let mut mix = (table[0x0FF - interp_index] * p0) >> 11;
    mix += (table[0x1FF - interp_index] * p1) >> 11;
    mix += (table[0x100 + interp_index] * p2) >> 11;

    // Clip to 15 bits before adding in the current sample.
    mix = ((mix as i16) << 1 >> 1).into();
    mix += (table[interp_index] * sample) >> 11;

    mix.clamp((i16::MIN >> 1).into(), (i16::MAX >> 1).into()) as i16
}

#[derive(Debug, Clone, Encode, Decode)]
struct DspRegisters {
    sample_table_address: u16,
    master_volume_l: i8,
    master_volume_r: i8,
    mute_amplifier: bool,
    soft_reset: bool,
    global_counter: u16,
    // Raw passthrough storage for registers with no behavior beyond store/load: the unused
    // per-voice slots ($xA, $xB, $xE, $xF) and the echo/noise globals this core doesn't
    // implement ($0D, $1D, $2D, $3D, $4D, $6D, $7D).
    raw: [u8; 128],
}

impl DspRegisters {
    fn new() -> Self {
        Self {
            sample_table_address: 0,
            master_volume_l: 0,
            master_volume_r: 0,
            mute_amplifier: true,
            soft_reset: true,
            global_counter: 0,
            raw: [0; 128],
        }
    }

    fn write_flg(&mut self, value: u8) {
        self.mute_amplifier = value.bit(6);
        self.soft_reset = value.bit(7);
    }

    fn read_flg(&self) -> u8 {
        (u8::from(self.mute_amplifier) << 6) | (u8::from(self.soft_reset) << 7)
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Dsp {
    voices: [Voice; 8],
    registers: DspRegisters,
    register_address: u8,
}

impl Dsp {
    pub fn new() -> Self {
        Self {
            voices: array::from_fn(|_| Voice::default()),
            registers: DspRegisters::new(),
            register_address: 0,
        }
    }

    pub fn read_address(&self) -> u8 {
        self.register_address
    }

    pub fn write_address(&mut self, address: u8) {
        // Per spec 4.1: wraps onto the 128-entry register file.
        self.register_address = address & 0x7F;
    }

    pub fn read_register(&self) -> u8 {
        let address = self.register_address & 0x7F;
        let voice = (address >> 4) as usize;

        match address & 0x0F {
            0x00 if voice < 8 => self.voices[voice].volume_l as u8,
            0x01 if voice < 8 => self.voices[voice].volume_r as u8,
            0x02 if voice < 8 => self.voices[voice].pitch as u8,
            0x03 if voice < 8 => self.voices[voice].last_pitch_h_write,
            0x04 if voice < 8 => self.voices[voice].instrument_number,
            0x05 if voice < 8 => self.voices[voice].read_adsr_low(),
            0x06 if voice < 8 => self.voices[voice].read_adsr_high(),
            0x07 if voice < 8 => self.voices[voice].read_gain(),
            0x08 if voice < 8 => self.voices[voice].read_envelope(),
            0x09 if voice < 8 => self.voices[voice].read_output(),
            0x0C | 0x0D => self.read_global(address),
            _ => self.registers.raw[address as usize],
        }
    }

    pub fn write_register(&mut self, value: u8) {
        // $80-$FF are not writable.
        if self.register_address >= 0x80 {
            return;
        }

        let address = self.register_address;
        let voice = (address >> 4) as usize;

        self.registers.raw[address as usize] = value;

        match address & 0x0F {
            0x00 if voice < 8 => self.voices[voice].volume_l = value as i8,
            0x01 if voice < 8 => self.voices[voice].volume_r = value as i8,
            0x02 if voice < 8 => self.voices[voice].write_pitch_low(value),
            0x03 if voice < 8 => self.voices[voice].write_pitch_high(value),
            0x04 if voice < 8 => self.voices[voice].instrument_number = value,
            0x05 if voice < 8 => self.voices[voice].write_adsr_low(value),
            0x06 if voice < 8 => self.voices[voice].write_adsr_high(value),
            0x07 if voice < 8 => self.voices[voice].write_gain(value),
            // $x8/$x9 (ENVX/OUTX) are nominally R/W on real hardware but the DSP overwrites them
            // every sample; writes are discarded.
            0x08 | 0x09 => {}
            0x0C | 0x0D => self.write_global(address, value),
            _ => {}
        }
    }

    fn read_global(&self, address: u8) -> u8 {
        match address {
            0x0C => self.registers.master_volume_l as u8,
            0x1C => self.registers.master_volume_r as u8,
            0x4C => voice_bitmask(&self.voices, |v| v.keyed_on),
            0x5C => voice_bitmask(&self.voices, |v| v.keyed_off),
            0x6C => self.registers.read_flg(),
            0x7C => voice_bitmask(&self.voices, |v| v.end_flag_seen),
            0x5D => (self.registers.sample_table_address >> 8) as u8,
            _ => self.registers.raw[address as usize],
        }
    }

    fn write_global(&mut self, address: u8, value: u8) {
        match address {
            0x0C => {
                self.registers.master_volume_l = value as i8;
            }
            0x1C => {
                self.registers.master_volume_r = value as i8;
            }
            0x4C => {
                for (i, voice) in self.voices.iter_mut().enumerate() {
                    voice.write_key_on(value.bit(i as u8));
                }
                log::trace!("Key on: {value:02X}");
            }
            0x5C => {
                for (i, voice) in self.voices.iter_mut().enumerate() {
                    voice.write_key_off(value.bit(i as u8));
                }
                log::trace!("Key off: {value:02X}");
            }
            0x6C => {
                self.registers.write_flg(value);
                if self.registers.soft_reset {
                    for voice in &mut self.voices {
                        voice.soft_reset();
                    }
                }
            }
            0x7C => {
                // ENDX: any write clears every flag.
                for voice in &mut self.voices {
                    voice.end_flag_seen = false;
                }
            }
            0x5D => {
                self.registers.sample_table_address = u16::from(value) << 8;
            }
            _ => {}
        }
    }

    /// Advance every voice by one sample and mix the result to a stereo pair. `ram` is the 64 KiB
    /// audio RAM, read-only from the DSP's perspective.
    #[must_use]
    pub fn clock(&mut self, ram: &[u8]) -> (i16, i16) {
        self.registers.global_counter = if self.registers.global_counter == 0 {
            0x77FF
        } else {
            self.registers.global_counter - 1
        };

        for voice in &mut self.voices {
            voice.clock(self.registers.sample_table_address, ram, self.registers.global_counter);
        }

        self.mix()
    }

    fn mix(&self) -> (i16, i16) {
        let mut sum_l = 0_i32;
        let mut sum_r = 0_i32;

        for voice in &self.voices {
            let sample = i32::from(voice.current_sample);
            sum_l += (sample * i32::from(voice.volume_l)) >> 7;
            sum_r += (sample * i32::from(voice.volume_r)) >> 7;
            sum_l = sum_l.clamp(i16::MIN.into(), i16::MAX.into());
            sum_r = sum_r.clamp(i16::MIN.into(), i16::MAX.into());
        }

        sum_l = ((sum_l * i32::from(self.registers.master_volume_l)) >> 7)
            .clamp(i16::MIN.into(), i16::MAX.into());
        sum_r = ((sum_r * i32::from(self.registers.master_volume_r)) >> 7)
            .clamp(i16::MIN.into(), i16::MAX.into());

        if self.registers.mute_amplifier {
            (0, 0)
        } else {
            (sum_l as i16, sum_r as i16)
        }
    }

    pub fn reset(&mut self) {
        self.registers.write_flg(0xE0);
        for voice in &mut self.voices {
            voice.soft_reset();
        }
    }
}

impl Default for Dsp {
    fn default() -> Self {
        Self::new()
    }
}

fn voice_bitmask(voices: &[Voice; 8], pred: impl Fn(&Voice) -> bool) -> u8 {
    voices.iter().enumerate().fold(0, |acc, (i, v)| acc | (u8::from(pred(v)) << i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn silent_ram() -> Box<[u8; 0x10000]> {
        Box::new([0; 0x10000])
    }

    #[test]
    fn silent_snapshot_produces_zero_samples() {
        let mut dsp = Dsp::new();
        dsp.write_address(0x6C);
        dsp.write_register(0x60); // FLG: mute + soft reset clear but mute set
        let ram = silent_ram();

        for _ in 0..32 {
            let (l, r) = dsp.clock(ram.as_ref());
            assert_eq!((l, r), (0, 0));
        }
    }

    #[test]
    fn key_on_then_silence_produces_non_zero_output_after_warmup() {
        let mut dsp = Dsp::new();
        let mut ram = silent_ram();

        // Unmute.
        dsp.write_address(0x6C);
        dsp.write_register(0x00);

        // DIR = 0x10 -> sample directory base 0x1000.
        dsp.write_address(0x5D);
        dsp.write_register(0x10);

        // Directory entry 0: start address 0x1000.
        ram[0x1000] = 0x00;
        ram[0x1001] = 0x10;
        ram[0x1002] = 0x00;
        ram[0x1003] = 0x10;

        // BRR block at 0x1000: header range=12 filter=0 loop=0 last=0, increasing nibbles.
        ram[0x1000] = 0xC0;
        for (i, byte) in [0x01u8, 0x23, 0x45, 0x67, 0x12, 0x34, 0x56, 0x78].iter().enumerate() {
            ram[0x1001 + i] = *byte;
        }

        // Voice 0: pitch = 0x1000 (quarter speed), full volume.
        dsp.write_address(0x02);
        dsp.write_register(0x00);
        dsp.write_address(0x03);
        dsp.write_register(0x10);
        dsp.write_address(0x00);
        dsp.write_register(0x7F);
        dsp.write_address(0x01);
        dsp.write_register(0x7F);

        // ADSR: ar=15 (fast attack), sl=7, sr=0 (hold at sustain).
        dsp.write_address(0x05);
        dsp.write_register(0x8F);
        dsp.write_address(0x06);
        dsp.write_register(0xE0);

        // Master volume full scale.
        dsp.write_address(0x0C);
        dsp.write_register(0x7F);
        dsp.write_address(0x1C);
        dsp.write_register(0x7F);

        // Key on voice 0.
        dsp.write_address(0x4C);
        dsp.write_register(0x01);

        let mut samples = Vec::new();
        for _ in 0..24 {
            samples.push(dsp.clock(ram.as_ref()));
        }

        assert!(samples.iter().any(|&(l, r)| l != 0 || r != 0));
    }

    #[test]
    fn flg_bit7_key_offs_every_voice() {
        let mut dsp = Dsp::new();
        for voice in &mut dsp.voices {
            voice.enabled = true;
            voice.envelope_phase = EnvelopePhase::Attack;
        }

        dsp.write_address(0x6C);
        dsp.write_register(0x80);

        for voice in &dsp.voices {
            assert_eq!(voice.envelope_phase, EnvelopePhase::Release);
            assert_eq!(voice.envelope_level, 0);
        }
    }

    #[test]
    fn endx_write_clears_all_flags() {
        let mut dsp = Dsp::new();
        for voice in &mut dsp.voices {
            voice.end_flag_seen = true;
        }

        dsp.write_address(0x7C);
        dsp.write_register(0xFF);

        dsp.write_address(0x7C);
        assert_eq!(dsp.read_register(), 0x00);
    }

    #[test]
    fn dsp_register_index_wraps_onto_128_entries() {
        let mut dsp = Dsp::new();
        dsp.write_address(0xFF);
        assert_eq!(dsp.read_address(), 0x7F);
    }
}
