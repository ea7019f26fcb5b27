//! Small simulation used by the demo binary and the integration tests
//!
//! A world of pawns ticked once per frame, a music player updated once per
//! frame, and enough call shapes to exercise every interception path:
//!
//! - `Rng.Next`: static, returns a value
//! - `Counter.Bump`: instance on a value type, mutates through a pointer
//! - `Pawn.TickRare`: virtual, overridden by `Colonist.TickRare`
//! - `Object.Describe`: virtual, reached through a constrained call
//! - `World.Tick`: instruction body calling all of the above
//! - `Music.Update`: target of the kill switch

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use perfscope_common::{Instruction, MethodId, MethodRef, ReceiverKind};

use super::program::{MethodBody, Program};
use super::value::Value;
use crate::domain::{HostError, PatchTarget, UpdateMode};
use crate::patching::{PatchSpec, ProfileMode};

pub struct SampleProgram {
    pub program: Arc<Program>,
    pub world_tick: MethodId,
    pub music_update: MethodId,
    pub frame: MethodId,
    pawns: Vec<Value>,
    music_plays: Arc<AtomicU64>,
}

/// Busy work standing in for real game logic.
fn spin(iterations: u64) -> u64 {
    (0..iterations).fold(0u64, |acc, i| black_box(acc.wrapping_mul(31).wrapping_add(i)))
}

fn bump_field(receiver: &Value, by: i64) -> Result<(), HostError> {
    let current = receiver.field(0)?.as_int()?;
    receiver.set_field(0, Value::Int(current + by))
}

impl SampleProgram {
    /// Build the world with `pawns` pawns, every third one a colonist.
    #[must_use]
    pub fn build(pawns: usize) -> Self {
        let program = Arc::new(Program::new());

        let seed = Arc::new(AtomicU64::new(0x2545_F491_4F6C_DD1D));
        let rng_next = program.define(
            MethodRef::new_static("Rng", "Next").param("Int").param("Int").returning(),
            MethodBody::native(move |_, args| {
                let (lo, hi) = (args[0].as_int()?, args[1].as_int()?);
                let state = seed.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
                if hi <= lo {
                    return Ok(Value::Int(lo));
                }
                #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
                let offset = (state >> 11) % (hi - lo) as u64;
                #[allow(clippy::cast_possible_wrap)]
                Ok(Value::Int(lo + offset as i64))
            }),
        );

        let bump = program.define(
            MethodRef::new_instance("Counter", "Bump", ReceiverKind::Value).param("Int"),
            MethodBody::native(|_, args| {
                bump_field(&args[0], args[1].as_int()?)?;
                Ok(Value::Unit)
            }),
        );

        let describe = program.define(
            MethodRef::new_instance("Object", "Describe", ReceiverKind::Reference).returning(),
            MethodBody::native(|_, args| Ok(Value::str(&args[0].runtime_type().unwrap_or_default()))),
        );
        let counter_describe = program.define(
            MethodRef::new_instance("Counter", "Describe", ReceiverKind::Value).returning(),
            MethodBody::native(|_, args| Ok(Value::str(&format!("Counter({})", args[0].field(0)?)))),
        );
        program.define_override("Counter", describe, counter_describe);

        let tick_rare = program.define(
            MethodRef::new_instance("Pawn", "TickRare", ReceiverKind::Reference),
            MethodBody::native(|_, args| {
                black_box(spin(2_000));
                bump_field(&args[0], 1)?;
                Ok(Value::Unit)
            }),
        );
        let colonist_tick = program.define(
            MethodRef::new_instance("Colonist", "TickRare", ReceiverKind::Reference),
            MethodBody::native(|_, args| {
                black_box(spin(6_000));
                bump_field(&args[0], 1)?;
                Ok(Value::Unit)
            }),
        );
        program.define_override("Colonist", tick_rare, colonist_tick);

        let world_tick = program.define(
            MethodRef::new_static("World", "Tick").param("Pawn"),
            MethodBody::il(
                1,
                vec![
                    Instruction::NewStruct { type_name: "Counter".to_string(), fields: 1 },
                    Instruction::StLoc(0),
                    Instruction::LdLocA(0),
                    Instruction::LdcI8(1),
                    Instruction::Call(bump),
                    Instruction::LdArg(0),
                    Instruction::CallVirt(tick_rare),
                    Instruction::LdcI8(0),
                    Instruction::LdcI8(100),
                    Instruction::Call(rng_next),
                    Instruction::Pop,
                    Instruction::LdLocA(0),
                    Instruction::Constrained("Counter".to_string()),
                    Instruction::CallVirt(describe),
                    Instruction::Pop,
                    Instruction::Ret,
                ],
            ),
        );

        let music_plays = Arc::new(AtomicU64::new(0));
        let plays = Arc::clone(&music_plays);
        let music_update = program.define(
            MethodRef::new_static("Music", "Update"),
            MethodBody::native(move |_, _| {
                black_box(spin(1_500));
                plays.fetch_add(1, Ordering::Relaxed);
                Ok(Value::Unit)
            }),
        );

        let pawns: Vec<Value> = (0..pawns)
            .map(|i| {
                let type_name = if i % 3 == 2 { "Colonist" } else { "Pawn" };
                Value::object(type_name, vec![Value::Int(0)])
            })
            .collect();

        let frame_pawns = pawns.clone();
        let frame = program.define(
            MethodRef::new_static("Game", "Frame"),
            MethodBody::native(move |program, _| {
                for pawn in &frame_pawns {
                    program.invoke(world_tick, &mut [pawn.clone()])?;
                }
                program.invoke(music_update, &mut [])?;
                Ok(Value::Unit)
            }),
        );

        Self { program, world_tick, music_update, frame, pawns, music_plays }
    }

    /// Run one frame of the simulation.
    pub fn run_frame(&self) -> Result<(), HostError> {
        self.program.invoke(self.frame, &mut []).map(|_| ())
    }

    /// Total pawn ticks so far
    #[must_use]
    pub fn pawn_ticks(&self) -> i64 {
        self.pawns.iter().filter_map(|p| p.field(0).ok()?.as_int().ok()).sum()
    }

    /// Times the music player actually ran
    #[must_use]
    pub fn music_plays(&self) -> u64 {
        self.music_plays.load(Ordering::Relaxed)
    }

    /// Built-in profile modes for this program.
    #[must_use]
    pub fn modes(kill_music: &Arc<AtomicBool>) -> Vec<ProfileMode> {
        vec![
            ProfileMode::new(
                "Pawns",
                UpdateMode::Tick,
                vec![
                    PatchSpec::measure(PatchTarget::new("World", "Tick")).with_internal_rewrite(),
                    PatchSpec::measure(PatchTarget::new("Pawn", "TickRare")).with_label("Pawn rare tick"),
                    PatchSpec::measure(PatchTarget::new("Colonist", "TickRare")).with_label("Colonist rare tick"),
                ],
            )
            .with_tip("World tick plus every call inside it"),
            ProfileMode::new(
                "Frame",
                UpdateMode::Update,
                vec![
                    PatchSpec::measure(PatchTarget::new("Game", "Frame")),
                    PatchSpec::measure(PatchTarget::new("Music", "Update")),
                    PatchSpec::measure(PatchTarget::new("Rng", "Next")),
                ],
            )
            .with_tip("Per-frame update work"),
            ProfileMode::new(
                "KillMusic",
                UpdateMode::Update,
                vec![
                    PatchSpec::kill_switch(PatchTarget::new("Music", "Update"), Arc::clone(kill_music)),
                    PatchSpec::measure(PatchTarget::new("Game", "Frame")),
                ],
            )
            .with_tip("Skip music updates while the switch is on"),
            ProfileMode::new("Home", UpdateMode::Dead, Vec::new()).with_tip("Nothing is patched"),
        ]
    }
}
