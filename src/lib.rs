//! # WM8731 Driver
//!
//! This is a driver for the Wolfson WM8731 audio CODEC.
//!
//! Specifically, this driver is for setting the registers in the WM8731 over
//! I²C - this driver does not handle the digital audio interface (I²S, or
//! similar).
//!
//! The WM8731 has the following inputs and outputs:
//!
//! * Stereo analog Line-level Input
//! * Mono analog Microphone Input
//! * Stereo analog Line-level Output
//! * Stereo analog Amplified Headphone Output
//! * Stereo digital Output
//! * Stereo digital Input
//!
//! The [`Codec`] object must cache the register contents because the WM8731
//! only has a *write-only* interface and you cannot read back any register
//! contents. The cache always holds the value most recently written (or
//! attempted) for each register, and snaps back to the chip's power-on
//! defaults whenever the chip itself is reset.
//!
//! On top of the register proxy, this driver sequences the chip's power-up
//! and power-down protocols. The WM8731 wants its supplies brought up and
//! torn down in a documented order with settling delays in between;
//! skipping a step produces audible pops or leaves the chip wedged in an
//! undefined state. [`Codec::enable`] and [`Codec::disable`] run those
//! sequences in full and block until the chip has settled.
//!
//! # Example
//!
//! You might bring the Codec up like this:
//!
//! ```rust
//! # struct I2c;
//! # impl embedded_hal::blocking::i2c::Write for I2c {
//! #     type Error = ();
//! #     fn write(&mut self, address: embedded_hal::blocking::i2c::SevenBitAddress, bytes: &[u8]) -> Result<(), Self::Error> {
//! #         Ok(())
//! #     }
//! # }
//! # struct Timer;
//! # impl embedded_hal::blocking::delay::DelayMs<u16> for Timer {
//! #     fn delay_ms(&mut self, _ms: u16) {}
//! # }
//! # let mut i2c = I2c;
//! # let mut timer = Timer;
//! let mut codec = wm8731::Codec::new(None, wm8731::Mode::Controller);
//! if codec.probe(&mut i2c, &mut timer).is_err() {
//!     // Codec didn't respond
//! }
//! codec.set_input_gain(&mut i2c, wm8731::GAIN_0DB, wm8731::Channel::Both).unwrap();
//! codec.set_headphone_volume(&mut i2c, 0.75).unwrap();
//! ```

#![no_std]
#![deny(unsafe_code)]
#![deny(missing_docs)]

#[cfg(test)]
extern crate std;

//
// Public Types
//

/// The WM8731 has one of two I²C addresses, depending on whether the CSB
/// pin is pulled high or low.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// The address when the CSB pin is high
    CsbHigh = 0x1B,
    /// The address when the CSB pin is low
    CsbLow = 0x1A,
}

/// Selects either only the left channel, only the right channel, or both
/// channels together.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Just the left channel
    Left,
    /// Just the right channel
    Right,
    /// Both channels
    Both,
}

/// Whether the WM8731 generates or receives the audio bit clock and
/// left/right clocks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// WM8731 receives the BCLK and LRC signals. The documentation uses an
    /// archaic term beginning with S.
    Target = 0,
    /// WM8731 generates the BCLK and LRC signals. The documentation uses
    /// the archaic term beginning with M.
    Controller = 1,
}

/// Power state of the chip, as implied by the power-down register.
///
/// This is never tracked separately - it is always derived from the cached
/// power-down register value, so it cannot drift from what was last
/// written to the chip.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerState {
    /// Core and output supplies are up.
    FullyPowered,
    /// Core supplies are up but the output stage is down.
    OutputsDown,
    /// Every supply is down.
    FullyDown,
}

/// Returned when the bus keeps refusing a register write.
///
/// The link to the codec is point-to-point, so a rejected transaction is
/// expected to be a momentary glitch. The write path retries back-to-back
/// with no backoff; once the attempt cap is reached the last bus error is
/// handed back together with the attempt count, rather than blocking the
/// caller forever.
///
/// If this comes out of [`Codec::enable`], [`Codec::disable`] or
/// [`Codec::probe`], the chip was left partway through a power sequence and
/// is in an unspecified state; recover by running [`Codec::enable`] again
/// (it always tears the chip all the way down first).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransportError<E> {
    /// The bus error from the final attempt.
    pub cause: E,
    /// How many attempts were made before giving up.
    pub attempts: u8,
}

/// Represents the state inside our WM8731 chip.
pub struct Codec {
    bus_address: Option<BusAddress>,
    mode: Mode,
    register_cache: [u16; NUM_REGISTERS],
}

//
// Private Types
//

/// The set of registers in the WM8731
#[derive(Copy, Clone, Debug)]
enum Register {
    LeftLineIn = 0,
    RightLineIn = 1,
    LeftHeadphoneOut = 2,
    RightHeadphoneOut = 3,
    AnaloguePathControl = 4,
    DigitalPathControl = 5,
    PowerDownControl = 6,
    InterfaceFormat = 7,
    SamplingControl = 8,
    ActiveControl = 9,
    Reset = 15,
}

/// One named bit-field inside a register slot.
///
/// A field carries its own position and width, so a value can only ever be
/// masked into its own bits and can never spill into a neighbouring field
/// packed in the same register.
#[derive(Copy, Clone, Debug)]
struct Field {
    register: Register,
    shift: u8,
    width: u8,
}

//
// Public Data
//

/// The line-input gain code for 0 dB.
///
/// Gain codes run from 0 (-34.5 dB) to 31 (+12 dB) in 1.5 dB steps.
/// [`Codec::enable`] programs this value on both input channels.
pub const GAIN_0DB: u8 = 0x17;

//
// Private Data
//

const NUM_REGISTERS: usize = 10;

/// How many back-to-back attempts a register write makes before giving up.
const RETRY_LIMIT: u8 = 8;

// Power-down register values (it is a power *down* control: a 1 bit
// switches the domain off).
const POWER_UP_EXCEPT_OUTPUTS: u16 = 0x12;
const POWER_UP_OUTPUTS: u16 = 0x02;
const POWER_DOWN_ALL: u16 = 0x9F;
const OUTPUTS_DOWN_BIT: u16 = 1 << 4;
const POWER_OFF_BIT: u16 = 1 << 7;

/// Interface-format register value for I²S with 16-bit samples; the clock
/// role bit (MS) is OR'd in separately.
const INTERFACE_I2S_16BIT: u16 = 0x02;
const INTERFACE_ROLE_SHIFT: u8 = 6;

/// Sampling-control register value for normal mode, 256fs, 44.1 kHz, MCLK/1.
const SAMPLING_256FS_44K1: u16 = 0x20;

/// Link bit (bit 8) in the two headphone output registers.
const HEADPHONE_LINK_BIT: u16 = 1 << 8;

// Headphone volume codes run from 0x30 (-73 dB) to 0x7F (+6 dB); the
// output mutes below 0x30.
const HEADPHONE_MUTE_CODE: u16 = 0x2F;
const HEADPHONE_MAX_CODE: u16 = 0x7F;
const HEADPHONE_RANGE: f32 = 80.0;

// Settling delays required by the chip. These are hard minimums from the
// datasheet and the WAN0111 application note, not cosmetic pauses.
const POWER_SETTLE_MS: u16 = 100;
const OUTPUT_RAMP_MS: u16 = 500;
const MUTE_RAMP_MS: u16 = 100;
const DC_OFFSET_INTEGRATION_MS: u16 = 1000;
const DC_OFFSET_SETTLE_MS: u16 = 500;

//
// impls on Public Types
//

impl From<BusAddress> for u8 {
    fn from(addr: BusAddress) -> u8 {
        addr as u8
    }
}

impl Codec {
    /// Create a new WM8731 CODEC proxy object.
    ///
    /// Pass `None` as the address to have [`Codec::probe`] discover the
    /// codec at the default address ([`BusAddress::CsbLow`]); pass
    /// `Some(...)` if the board wiring is known. `mode` selects whether the
    /// chip drives or receives the audio clocks when it is enabled.
    ///
    /// This does no bus I/O - the register cache starts at the chip's
    /// power-on defaults, which is correct until something is written.
    pub fn new(bus_address: Option<BusAddress>, mode: Mode) -> Codec {
        let mut codec = Codec {
            bus_address,
            mode,
            register_cache: [0; NUM_REGISTERS],
        };
        codec.set_register_defaults();
        codec
    }

    /// The I²C address writes currently go to, if it has been supplied or
    /// discovered.
    ///
    /// Until a probe succeeds, an unresolved codec is addressed at
    /// [`BusAddress::CsbLow`].
    pub fn bus_address(&self) -> Option<BusAddress> {
        self.bus_address
    }

    /// The chip's power state, derived from the cached power-down register.
    pub fn power_state(&self) -> PowerState {
        let power = self.register_cache[Register::PowerDownControl as usize];
        if power & POWER_OFF_BIT != 0 {
            PowerState::FullyDown
        } else if power & OUTPUTS_DOWN_BIT != 0 {
            PowerState::OutputsDown
        } else {
            PowerState::FullyPowered
        }
    }

    /// Resets the internal register cache to WM8731 defaults, as per the
    /// datasheet.
    fn set_register_defaults(&mut self) {
        let mut set = |reg, value| {
            self.register_cache[reg as usize] = value;
        };
        // LeftLineIn - input muted, gain 0dB
        set(Register::LeftLineIn, 0b0_1001_0111);
        // RightLineIn - input muted, gain 0dB
        set(Register::RightLineIn, 0b0_1001_0111);
        // LeftHeadphoneOut - 0dB, zero-cross enabled
        set(Register::LeftHeadphoneOut, 0b0_0111_1001);
        // RightHeadphoneOut - 0dB, zero-cross enabled
        set(Register::RightHeadphoneOut, 0b0_0111_1001);
        // AnaloguePathControl - bypass on, DAC deselected, mic muted
        set(Register::AnaloguePathControl, 0b0_0000_1010);
        // DigitalPathControl - DAC soft mute, ADC high-pass filter on
        set(Register::DigitalPathControl, 0b0_0000_1000);
        // PowerDownControl - everything off
        set(Register::PowerDownControl, 0b0_1001_1111);
        // InterfaceFormat - I2S, 24-bit, clock receiver
        set(Register::InterfaceFormat, 0b0_0000_1010);
        // SamplingControl - normal mode, 256fs
        set(Register::SamplingControl, 0b0_0000_0000);
        // ActiveControl - digital interface inactive
        set(Register::ActiveControl, 0b0_0000_0000);
    }

    /// Mask a value into one field of the register cache, leaving the
    /// sibling bits in the slot untouched.
    fn set_field(&mut self, field: Field, value: u16) {
        let slot = &mut self.register_cache[field.register as usize];
        *slot &= !field.mask();
        *slot |= (value << field.shift) & field.mask();
    }

    /// Read one field back out of the register cache.
    ///
    /// Reads from the cache because the WM8731 is write-only.
    fn get_field(&self, field: Field) -> u16 {
        (self.register_cache[field.register as usize] & field.mask()) >> field.shift
    }

    /// Update one field in the cache, then push the whole register slot to
    /// the chip.
    ///
    /// The cache keeps the new value even if the bus write fails, so it
    /// always reflects the last *attempted* write.
    fn write_field<B>(&mut self, bus: &mut B, field: Field, value: u16) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        self.set_field(field, value);
        let value = self.register_cache[field.register as usize];
        self.write(bus, field.register as u8, value)
    }

    /// Replace a whole register slot in the cache and push it to the chip.
    fn write_register<B>(&mut self, bus: &mut B, register: Register, value: u16) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        let value = value & 0x1FF;
        self.register_cache[register as usize] = value;
        self.write(bus, register as u8, value)
    }

    /// Check that the codec responds, and bring it to its steady running
    /// state.
    ///
    /// Runs one full initialization sequence ([`Codec::disable`], a settle
    /// delay, then [`Codec::enable`]) at the explicit address if one was
    /// supplied, or at the default address otherwise. The default address
    /// is latched only once the codec has answered the whole sequence, so a
    /// failed probe leaves the address unresolved. Probing again is fine -
    /// it simply re-runs the initialization.
    pub fn probe<B, D>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
        D: embedded_hal::blocking::delay::DelayMs<u16>,
    {
        let latch = self.bus_address.is_none();
        self.disable(bus, delay)?;
        delay.delay_ms(POWER_SETTLE_MS);
        self.enable(bus, delay)?;
        if latch {
            self.bus_address = Some(BusAddress::CsbLow);
        }
        Ok(())
    }

    /// Power the codec down and reset it.
    ///
    /// The output stage is taken down first and given time to discharge,
    /// which avoids an audible pop; then the remaining supplies are dropped
    /// and the chip is reset. Afterwards the register cache matches the
    /// chip's power-on defaults again. Blocks for around 200 ms.
    pub fn disable<B, D>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
        D: embedded_hal::blocking::delay::DelayMs<u16>,
    {
        #[cfg(feature = "defmt")]
        defmt::info!("Disabling codec");

        let value = self.register_cache[Register::PowerDownControl as usize] | OUTPUTS_DOWN_BIT;
        self.write_register(bus, Register::PowerDownControl, value)?;
        delay.delay_ms(POWER_SETTLE_MS);

        self.write_register(bus, Register::PowerDownControl, POWER_DOWN_ALL)?;
        delay.delay_ms(POWER_SETTLE_MS);

        self.reset_codec(bus)
    }

    /// Power the codec up and unmute it, from any prior state.
    ///
    /// Always runs [`Codec::disable`] first - enabling is defined as "tear
    /// down, then bring up cleanly", so the sequence never depends on what
    /// the chip was doing before. Calling this twice in a row lands in
    /// exactly the same state as calling it once.
    ///
    /// The bring-up follows the sequence from the WAN0111 application note:
    /// reset, core power-up, audio path configuration, digital interface
    /// configuration and activation, then output power-up last. The
    /// headphone outputs come up linked but with the volume below the mute
    /// floor; raise them afterwards with [`Codec::set_headphone_volume`].
    ///
    /// Every delay in here is a minimum settling time required by the chip.
    /// All told this blocks for around 1.3 seconds.
    pub fn enable<B, D>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
        D: embedded_hal::blocking::delay::DelayMs<u16>,
    {
        self.disable(bus, delay)?;

        #[cfg(feature = "defmt")]
        defmt::info!("Enabling codec");

        self.reset_codec(bus)?;
        delay.delay_ms(POWER_SETTLE_MS);

        // Power up all domains except the output stage and the microphone
        self.write_register(bus, Register::PowerDownControl, POWER_UP_EXCEPT_OUTPUTS)?;
        delay.delay_ms(POWER_SETTLE_MS);

        self.set_bypass(bus, false)?;
        self.set_dac_selected(bus, true)?;
        self.set_hpf_disabled(bus, true)?;
        self.set_input_gain(bus, GAIN_0DB, Channel::Both)?;
        self.set_input_mute(bus, false, Channel::Both)?;
        self.set_dac_mute(bus, false)?;

        // Link the headphone channels but hold the volume below the mute
        // floor, so the output stage comes up silent
        self.write_register(bus, Register::LeftHeadphoneOut, HEADPHONE_LINK_BIT)?;
        self.write_register(bus, Register::RightHeadphoneOut, HEADPHONE_LINK_BIT)?;

        let role = (self.mode as u16) << INTERFACE_ROLE_SHIFT;
        self.write_register(bus, Register::InterfaceFormat, INTERFACE_I2S_16BIT | role)?;
        self.write_register(bus, Register::SamplingControl, SAMPLING_256FS_44K1)?;
        delay.delay_ms(POWER_SETTLE_MS);

        self.set_digital_interface_enabled(bus, true)?;
        delay.delay_ms(POWER_SETTLE_MS);

        // Output stage last
        self.write_register(bus, Register::PowerDownControl, POWER_UP_OUTPUTS)?;
        delay.delay_ms(OUTPUT_RAMP_MS);
        delay.delay_ms(MUTE_RAMP_MS);

        Ok(())
    }

    /// Re-measure and store the ADC's DC offset correction.
    ///
    /// Mutes both inputs, runs the high-pass filter in store-offset mode
    /// while the chip integrates the correction, then switches the filter
    /// back off and unmutes. Blocks for around 1.5 seconds.
    ///
    /// This is a maintenance operation, separate from the normal
    /// enable/disable lifecycle. The caller must make sure no audio is
    /// streaming while it runs - the muting here cannot be made atomic
    /// with the streaming path.
    pub fn recalibrate_dc_offset<B, D>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
        D: embedded_hal::blocking::delay::DelayMs<u16>,
    {
        const STORE_OFFSET: Field = Field::new(Register::DigitalPathControl, 4, 1);

        self.set_input_mute(bus, true, Channel::Both)?;

        // High-pass filter on, with the measured offset stored when it is
        // switched off again
        self.set_hpf_disabled(bus, false)?;
        self.write_field(bus, STORE_OFFSET, 1)?;
        delay.delay_ms(DC_OFFSET_INTEGRATION_MS);

        self.set_hpf_disabled(bus, true)?;
        delay.delay_ms(DC_OFFSET_SETTLE_MS);

        self.set_input_mute(bus, false, Channel::Both)?;
        Ok(())
    }

    /// Set the line-input gain code on one or both channels.
    ///
    /// * A value of 0 is -34.5 dB
    /// * A value of [`GAIN_0DB`] (23) is 0 dB
    /// * A value of 31 is +12 dB
    ///
    /// There is 1.5 dB per step. Values will be truncated to 5 bits long.
    /// Takes effect immediately.
    pub fn set_input_gain<B>(&mut self, bus: &mut B, steps: u8, channel: Channel) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const LEFT: Field = Field::new(Register::LeftLineIn, 0, 5);
        const RIGHT: Field = Field::new(Register::RightLineIn, 0, 5);
        if channel == Channel::Left || channel == Channel::Both {
            self.write_field(bus, LEFT, u16::from(steps))?;
        }
        if channel == Channel::Right || channel == Channel::Both {
            self.write_field(bus, RIGHT, u16::from(steps))?;
        }
        Ok(())
    }

    /// Get the cached line-input gain codes for both channels.
    ///
    /// See [`Codec::set_input_gain`].
    pub fn get_input_gain(&self) -> (u8, u8) {
        const LEFT: Field = Field::new(Register::LeftLineIn, 0, 5);
        const RIGHT: Field = Field::new(Register::RightLineIn, 0, 5);
        (self.get_field(LEFT) as u8, self.get_field(RIGHT) as u8)
    }

    /// Mute or unmute the line input on one or both channels.
    pub fn set_input_mute<B>(&mut self, bus: &mut B, mute: bool, channel: Channel) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const LEFT: Field = Field::new(Register::LeftLineIn, 7, 1);
        const RIGHT: Field = Field::new(Register::RightLineIn, 7, 1);
        if channel == Channel::Left || channel == Channel::Both {
            self.write_field(bus, LEFT, u16::from(mute))?;
        }
        if channel == Channel::Right || channel == Channel::Both {
            self.write_field(bus, RIGHT, u16::from(mute))?;
        }
        Ok(())
    }

    /// Get whether the line input is muted, per channel.
    ///
    /// See [`Codec::set_input_mute`].
    pub fn get_input_mute(&self) -> (bool, bool) {
        const LEFT: Field = Field::new(Register::LeftLineIn, 7, 1);
        const RIGHT: Field = Field::new(Register::RightLineIn, 7, 1);
        (self.get_field(LEFT) != 0, self.get_field(RIGHT) != 0)
    }

    /// Link the left and right line-input controls together.
    ///
    /// While linked, the chip applies a gain or mute change on either
    /// channel to both. The link bit lives in both input registers, so
    /// this performs two register writes.
    pub fn set_input_linked<B>(&mut self, bus: &mut B, linked: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const LEFT: Field = Field::new(Register::LeftLineIn, 8, 1);
        const RIGHT: Field = Field::new(Register::RightLineIn, 8, 1);
        self.write_field(bus, LEFT, u16::from(linked))?;
        self.write_field(bus, RIGHT, u16::from(linked))
    }

    /// Get whether the left and right line-input controls are linked.
    pub fn get_input_linked(&self) -> bool {
        const LEFT: Field = Field::new(Register::LeftLineIn, 8, 1);
        self.get_field(LEFT) != 0
    }

    /// Swap the left and right channels on the digital interface.
    pub fn set_left_right_swap<B>(&mut self, bus: &mut B, swap: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const SWAP: Field = Field::new(Register::InterfaceFormat, 5, 1);
        self.write_field(bus, SWAP, u16::from(swap))
    }

    /// Get whether the left and right channels are swapped.
    pub fn get_left_right_swap(&self) -> bool {
        const SWAP: Field = Field::new(Register::InterfaceFormat, 5, 1);
        self.get_field(SWAP) != 0
    }

    /// Set the headphone output volume from a normalized level.
    ///
    /// `0.0` and below map to the mute floor (the chip mutes the output
    /// for any code under 0x30), `1.0` and above map to the maximum +6 dB
    /// code, and levels in between map linearly across the 80 usable
    /// codes.
    ///
    /// Only the *left* headphone register is driven here. [`Codec::enable`]
    /// sets the link bit in both headphone registers, which makes the chip
    /// track the right channel automatically; if you unlink the channels,
    /// right-channel volume is yours to manage via [`Codec::write_raw`].
    pub fn set_headphone_volume<B>(&mut self, bus: &mut B, level: f32) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const VOLUME: Field = Field::new(Register::LeftHeadphoneOut, 0, 7);
        let code = if level <= 0.0 {
            HEADPHONE_MUTE_CODE
        } else if level >= 1.0 {
            HEADPHONE_MAX_CODE
        } else {
            // level is strictly inside (0, 1) here, so the sum stays in
            // range; the half-step makes the cast round to nearest
            HEADPHONE_MUTE_CODE + (level * HEADPHONE_RANGE + 0.5) as u16
        };
        self.write_field(bus, VOLUME, code)
    }

    /// Get the cached headphone volume code for the left channel.
    ///
    /// Codes run from 0x30 (-73 dB) to 0x7F (+6 dB); anything below 0x30
    /// means the output is muted.
    pub fn get_headphone_volume_code(&self) -> u8 {
        const VOLUME: Field = Field::new(Register::LeftHeadphoneOut, 0, 7);
        self.get_field(VOLUME) as u8
    }

    /// Mute or unmute the DAC.
    pub fn set_dac_mute<B>(&mut self, bus: &mut B, mute: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const DAC_MUTE: Field = Field::new(Register::DigitalPathControl, 3, 1);
        self.write_field(bus, DAC_MUTE, u16::from(mute))
    }

    /// Get whether the DAC is muted.
    pub fn get_dac_mute(&self) -> bool {
        const DAC_MUTE: Field = Field::new(Register::DigitalPathControl, 3, 1);
        self.get_field(DAC_MUTE) != 0
    }

    /// Control whether the DAC is routed to the analog output stage.
    ///
    /// The DAC must be selected (pass `true` here) to hear it on the
    /// outputs.
    pub fn set_dac_selected<B>(&mut self, bus: &mut B, selected: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const DAC_SELECT: Field = Field::new(Register::AnaloguePathControl, 4, 1);
        self.write_field(bus, DAC_SELECT, u16::from(selected))
    }

    /// Get whether the DAC is routed to the analog output stage.
    pub fn get_dac_selected(&self) -> bool {
        const DAC_SELECT: Field = Field::new(Register::AnaloguePathControl, 4, 1);
        self.get_field(DAC_SELECT) != 0
    }

    /// Set bypass mode.
    ///
    /// In bypass mode the line input is routed straight to the line
    /// output, around the ADC and DAC. Switching it causes a slight click.
    pub fn set_bypass<B>(&mut self, bus: &mut B, bypass: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const BYPASS: Field = Field::new(Register::AnaloguePathControl, 3, 1);
        self.write_field(bus, BYPASS, u16::from(bypass))
    }

    /// Get bypass mode.
    ///
    /// See [`Codec::set_bypass`].
    pub fn get_bypass(&self) -> bool {
        const BYPASS: Field = Field::new(Register::AnaloguePathControl, 3, 1);
        self.get_field(BYPASS) != 0
    }

    /// Disable or enable the ADC's dynamic high-pass filter.
    ///
    /// The filter continuously re-estimates the input DC offset, which
    /// adds noise; it is normally left disabled and only switched on
    /// briefly by [`Codec::recalibrate_dc_offset`].
    pub fn set_hpf_disabled<B>(&mut self, bus: &mut B, disabled: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const HPF_DISABLE: Field = Field::new(Register::DigitalPathControl, 0, 1);
        self.write_field(bus, HPF_DISABLE, u16::from(disabled))
    }

    /// Get whether the ADC's high-pass filter is disabled.
    pub fn get_hpf_disabled(&self) -> bool {
        const HPF_DISABLE: Field = Field::new(Register::DigitalPathControl, 0, 1);
        self.get_field(HPF_DISABLE) != 0
    }

    /// Turn the digital audio interface on or off.
    ///
    /// This is separate from the power domains: the interface only passes
    /// samples once it has been activated.
    pub fn set_digital_interface_enabled<B>(&mut self, bus: &mut B, enabled: bool) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        const ACTIVE: Field = Field::new(Register::ActiveControl, 0, 1);
        self.write_field(bus, ACTIVE, u16::from(enabled))
    }

    /// Get whether the digital audio interface is active.
    pub fn get_digital_interface_enabled(&self) -> bool {
        const ACTIVE: Field = Field::new(Register::ActiveControl, 0, 1);
        self.get_field(ACTIVE) != 0
    }

    /// Write a raw 9-bit value directly to a register.
    ///
    /// Escape hatch for registers and bits this driver does not model.
    /// Uses the same encoding and retry policy as every other write, but
    /// does *not* touch the register cache - keeping the cache truthful is
    /// the caller's problem when going through here.
    pub fn write_raw<B>(&mut self, bus: &mut B, register: u8, value: u16) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        self.write(bus, register & 0x7F, value & 0x1FF)
    }

    /// Pulse the on-chip reset and snap the register cache back to the
    /// power-on defaults.
    fn reset_codec<B>(&mut self, bus: &mut B) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        self.write(bus, Register::Reset as u8, 0)?;
        self.set_register_defaults();
        Ok(())
    }

    /// Push one register value over the bus, retrying transient failures.
    ///
    /// The 7-bit register index and the 9-bit value are packed into two
    /// bytes: the index and the value's top bit in the first, the low
    /// eight value bits in the second.
    fn write<B>(&mut self, bus: &mut B, register: u8, value: u16) -> Result<(), TransportError<B::Error>>
    where
        B: embedded_hal::blocking::i2c::Write,
    {
        let buffer = [
            (register << 1) | ((value >> 8) & 1) as u8,
            (value & 0xFF) as u8,
        ];
        let address = u8::from(self.bus_address.unwrap_or(BusAddress::CsbLow));
        let mut attempts = 0;
        loop {
            match bus.write(address, &buffer) {
                Ok(()) => {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("Setting WM8731 0x{:02x} to 0x{:03x}", register, value);
                    return Ok(());
                }
                Err(cause) => {
                    attempts += 1;
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "WM8731 write to 0x{:02x} not accepted (attempt {})",
                        register,
                        attempts
                    );
                    if attempts >= RETRY_LIMIT {
                        return Err(TransportError { cause, attempts });
                    }
                }
            }
        }
    }
}

//
// impls on Private Types
//

impl Field {
    const fn new(register: Register, shift: u8, width: u8) -> Field {
        Field {
            register,
            shift,
            width,
        }
    }

    const fn mask(self) -> u16 {
        ((1 << self.width) - 1) << self.shift
    }
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    /// Chip reset defaults, straight from the datasheet.
    const RESET_DEFAULTS: [u16; NUM_REGISTERS] =
        [0x97, 0x97, 0x79, 0x79, 0x0A, 0x08, 0x9F, 0x0A, 0x00, 0x00];

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Nack;

    /// Records every accepted write, optionally rejecting the first N
    /// transactions.
    struct Bus {
        writes: Vec<(u8, [u8; 2])>,
        fail_first: u32,
        calls: u32,
    }

    impl Bus {
        fn new() -> Bus {
            Bus::failing(0)
        }

        fn failing(fail_first: u32) -> Bus {
            Bus {
                writes: Vec::new(),
                fail_first,
                calls: 0,
            }
        }

        /// Register indices of the accepted writes, in order.
        fn registers(&self) -> Vec<u8> {
            self.writes.iter().map(|(_, bytes)| bytes[0] >> 1).collect()
        }
    }

    impl embedded_hal::blocking::i2c::Write for Bus {
        type Error = Nack;
        fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Nack> {
            self.calls += 1;
            if self.calls <= self.fail_first {
                return Err(Nack);
            }
            let mut buffer = [0u8; 2];
            buffer.copy_from_slice(bytes);
            self.writes.push((address, buffer));
            Ok(())
        }
    }

    struct Timer {
        waits: Vec<u16>,
    }

    impl Timer {
        fn new() -> Timer {
            Timer { waits: Vec::new() }
        }
    }

    impl embedded_hal::blocking::delay::DelayMs<u16> for Timer {
        fn delay_ms(&mut self, ms: u16) {
            self.waits.push(ms);
        }
    }

    fn codec() -> Codec {
        Codec::new(Some(BusAddress::CsbLow), Mode::Controller)
    }

    #[test]
    fn new_codec_starts_at_reset_defaults() {
        let codec = codec();
        assert_eq!(codec.register_cache, RESET_DEFAULTS);
        assert_eq!(codec.power_state(), PowerState::FullyDown);
    }

    #[test]
    fn input_gain_leaves_sibling_bits_alone() {
        let mut bus = Bus::new();
        let mut codec = codec();
        // reset default has the mute bit set; gain must not clobber it
        codec.set_input_gain(&mut bus, 0x05, Channel::Left).unwrap();
        assert_eq!(codec.register_cache[0], 0x85);
        assert_eq!(codec.register_cache[1], 0x97);
        assert_eq!(codec.get_input_mute(), (true, true));
    }

    #[test]
    fn over_wide_gain_is_masked_to_field_width() {
        let mut bus = Bus::new();
        let mut codec = codec();
        codec.set_input_gain(&mut bus, 0xFF, Channel::Right).unwrap();
        assert_eq!(codec.get_input_gain().1, 0x1F);
        assert_eq!(codec.register_cache[1], 0x9F);
    }

    #[test]
    fn input_link_drives_bit_eight_of_both_registers() {
        let mut bus = Bus::new();
        let mut codec = codec();
        codec.set_input_linked(&mut bus, true).unwrap();
        assert_eq!(codec.register_cache[0], 0x197);
        assert_eq!(codec.register_cache[1], 0x197);
        assert!(codec.get_input_linked());
        // the ninth register bit travels in the first byte's low bit
        assert_eq!(bus.writes[0].1, [0x01, 0x97]);
        assert_eq!(bus.writes[1].1, [0x03, 0x97]);
    }

    #[test]
    fn left_right_swap_lives_in_the_interface_register() {
        let mut bus = Bus::new();
        let mut codec = codec();
        codec.set_left_right_swap(&mut bus, true).unwrap();
        assert_eq!(codec.register_cache[7], 0x2A);
        assert_eq!(codec.register_cache[5], 0x08);
        assert!(codec.get_left_right_swap());
    }

    #[test]
    fn headphone_volume_maps_onto_the_usable_code_range() {
        let mut bus = Bus::new();
        let mut codec = codec();
        for (level, code) in [
            (0.0, 0x2F),
            (1.0, 0x7F),
            (0.5, 0x57),
            (0.25, 0x43),
            (-2.0, 0x2F),
            (3.0, 0x7F),
        ] {
            codec.set_headphone_volume(&mut bus, level).unwrap();
            assert_eq!(codec.get_headphone_volume_code(), code, "level {}", level);
        }
        // only the left register is driven; the link bit makes the chip
        // track the right channel
        assert!(bus.registers().iter().all(|&reg| reg == 2));
        assert_eq!(codec.register_cache[3], 0x79);
    }

    #[test]
    fn disable_restores_reset_defaults() {
        let mut bus = Bus::new();
        let mut timer = Timer::new();
        let mut codec = codec();
        codec.disable(&mut bus, &mut timer).unwrap();
        assert_eq!(codec.register_cache, RESET_DEFAULTS);
        assert_eq!(codec.power_state(), PowerState::FullyDown);
        // outputs down, everything down, reset pulse
        assert_eq!(bus.registers(), [6, 6, 15]);
        assert_eq!(bus.writes[0].1, [0x0C, 0x9F]);
        assert_eq!(bus.writes[1].1, [0x0C, 0x9F]);
        assert_eq!(bus.writes[2].1, [0x1E, 0x00]);
        assert_eq!(timer.waits, [100, 100]);
    }

    #[test]
    fn enable_runs_the_full_bring_up_sequence() {
        let mut bus = Bus::new();
        let mut timer = Timer::new();
        let mut codec = codec();
        codec.enable(&mut bus, &mut timer).unwrap();
        assert_eq!(
            bus.registers(),
            [6, 6, 15, 15, 6, 4, 4, 5, 0, 1, 0, 1, 5, 2, 3, 7, 8, 9, 6]
        );
        assert_eq!(timer.waits, [100, 100, 100, 100, 100, 100, 500, 100]);
        assert_eq!(
            codec.register_cache,
            [0x17, 0x17, 0x100, 0x100, 0x12, 0x01, 0x02, 0x42, 0x20, 0x01]
        );
        assert_eq!(codec.power_state(), PowerState::FullyPowered);
        assert!(codec.get_digital_interface_enabled());
        assert_eq!(codec.get_input_mute(), (false, false));
    }

    #[test]
    fn enable_twice_matches_enable_once() {
        let mut bus = Bus::new();
        let mut timer = Timer::new();
        let mut once = codec();
        once.enable(&mut bus, &mut timer).unwrap();

        let mut twice = codec();
        twice.enable(&mut bus, &mut timer).unwrap();
        twice.enable(&mut bus, &mut timer).unwrap();
        assert_eq!(once.register_cache, twice.register_cache);
    }

    #[test]
    fn target_mode_clears_the_clock_role_bit() {
        let mut bus = Bus::new();
        let mut timer = Timer::new();
        let mut codec = Codec::new(Some(BusAddress::CsbLow), Mode::Target);
        codec.enable(&mut bus, &mut timer).unwrap();
        assert_eq!(codec.register_cache[7], 0x02);
    }

    #[test]
    fn recalibration_restores_mute_and_filter_state() {
        let mut bus = Bus::new();
        let mut timer = Timer::new();
        let mut codec = codec();
        codec.enable(&mut bus, &mut timer).unwrap();

        let mut bus = Bus::new();
        let mut timer = Timer::new();
        codec.recalibrate_dc_offset(&mut bus, &mut timer).unwrap();
        assert_eq!(bus.registers(), [0, 1, 5, 5, 5, 0, 1]);
        assert_eq!(timer.waits, [1000, 500]);
        assert_eq!(codec.get_input_mute(), (false, false));
        assert!(codec.get_hpf_disabled());
        // the store-offset bit stays set; it only acts while the filter
        // settings change
        assert_eq!(codec.register_cache[5], 0x11);
    }

    #[test]
    fn write_retries_transient_failures_without_corrupting_the_cache() {
        let mut bus = Bus::failing(3);
        let mut codec = codec();
        codec.set_dac_mute(&mut bus, false).unwrap();
        assert_eq!(bus.calls, 4);
        assert_eq!(bus.writes.len(), 1);
        assert_eq!(codec.register_cache[5], 0x00);
        assert!(!codec.get_dac_mute());
    }

    #[test]
    fn write_gives_up_after_the_retry_limit() {
        let mut bus = Bus::failing(u32::MAX);
        let mut codec = codec();
        let result = codec.set_dac_mute(&mut bus, false);
        assert_eq!(
            result,
            Err(TransportError {
                cause: Nack,
                attempts: RETRY_LIMIT
            })
        );
        assert_eq!(bus.calls, u32::from(RETRY_LIMIT));
        // the cache reflects the attempted write, as documented
        assert_eq!(codec.register_cache[5], 0x00);
    }

    #[test]
    fn probe_latches_the_default_address_on_success() {
        let mut bus = Bus::new();
        let mut timer = Timer::new();
        let mut codec = Codec::new(None, Mode::Controller);
        assert_eq!(codec.bus_address(), None);
        codec.probe(&mut bus, &mut timer).unwrap();
        assert_eq!(codec.bus_address(), Some(BusAddress::CsbLow));
        assert!(bus.writes.iter().all(|&(address, _)| address == 0x1A));
        // probing again just re-runs the init sequence
        codec.probe(&mut bus, &mut timer).unwrap();
        assert_eq!(codec.bus_address(), Some(BusAddress::CsbLow));
    }

    #[test]
    fn failed_probe_returns_instead_of_hanging() {
        let mut bus = Bus::failing(u32::MAX);
        let mut timer = Timer::new();
        let mut codec = Codec::new(None, Mode::Controller);
        let result = codec.probe(&mut bus, &mut timer);
        assert_eq!(
            result,
            Err(TransportError {
                cause: Nack,
                attempts: RETRY_LIMIT
            })
        );
        assert_eq!(codec.bus_address(), None);
    }

    #[test]
    fn explicit_address_is_used_on_the_wire() {
        let mut bus = Bus::new();
        let mut codec = Codec::new(Some(BusAddress::CsbHigh), Mode::Controller);
        codec.set_dac_mute(&mut bus, true).unwrap();
        assert_eq!(bus.writes[0].0, 0x1B);
    }

    #[test]
    fn raw_writes_use_the_two_byte_encoding() {
        let mut bus = Bus::new();
        let mut codec = codec();
        codec.write_raw(&mut bus, 9, 0x001).unwrap();
        codec.write_raw(&mut bus, 2, 0x100).unwrap();
        assert_eq!(bus.writes[0], (0x1A, [0x12, 0x01]));
        assert_eq!(bus.writes[1], (0x1A, [0x05, 0x00]));
    }

    #[test]
    fn raw_writes_bypass_the_cache() {
        let mut bus = Bus::new();
        let mut codec = codec();
        codec.write_raw(&mut bus, 0, 0x055).unwrap();
        assert_eq!(codec.register_cache[0], 0x97);
    }

    #[test]
    fn power_state_tracks_the_power_register() {
        let mut codec = codec();
        assert_eq!(codec.power_state(), PowerState::FullyDown);
        codec.register_cache[Register::PowerDownControl as usize] = POWER_UP_EXCEPT_OUTPUTS;
        assert_eq!(codec.power_state(), PowerState::OutputsDown);
        codec.register_cache[Register::PowerDownControl as usize] = POWER_UP_OUTPUTS;
        assert_eq!(codec.power_state(), PowerState::FullyPowered);
    }
}

//
// End of file
//
