//! Capability surfaces the core requires from its host.
//!
//! The core never talks to a platform directly; rendering, audio and error
//! reporting are injected behind these traits. All of them are minimal on
//! purpose: they describe exactly what the core calls, nothing more.

use crate::{
    error::BoxedErr,
    event::{EventTypeId, SubscriptionId},
    system::SystemId,
};

/// A two-component vector, used where the capability surfaces need a
/// position without dragging in a math crate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f32,
    /// Vertical component.
    pub y: f32,
}

impl Vec2 {
    /// Creates a vector from components.
    pub fn new(x: f32, y: f32) -> Self {
        Vec2 { x, y }
    }
}

/// Host-assigned texture identifier.
pub type TextureId = u32;

/// Host-assigned sound identifier.
pub type SoundId = u32;

/// Drawing capability provided by the caller. The core invokes it only from
/// the render pass of `render_systems`.
pub trait Renderer {
    /// Queues a sprite for the current frame.
    fn draw_sprite(
        &mut self,
        texture: TextureId,
        position: Vec2,
        scale: Vec2,
        rotation: f32,
        z_order: i32,
    );

    /// Clears the backbuffer.
    fn clear(&mut self);

    /// Presents the finished frame.
    fn present(&mut self);
}

/// Audio capability provided by the caller. Called from game systems, never
/// by the core itself.
pub trait AudioEngine {
    /// Starts playback of a sound.
    fn play(&mut self, sound: SoundId, volume: f32, pitch: f32, looping: bool);

    /// Stops all playback of a sound.
    fn stop(&mut self, sound: SoundId);

    /// Moves the listener used for panning/attenuation.
    fn set_listener_position(&mut self, position: Vec2);

    /// Whether any instance of the sound is still playing.
    fn is_playing(&self, sound: SoundId) -> bool;
}

/// Error sink for operational failures. The default implementations do
/// nothing; install via the system manager and event bus if wanted.
pub trait ErrorSink: Send + Sync {
    /// A system's update/render returned an error, panicked, or timed out.
    fn on_system_error(&self, system: SystemId, error: &BoxedErr) {
        let _ = (system, error);
    }

    /// An event handler returned an error.
    fn on_handler_error(
        &self,
        event_type: EventTypeId,
        subscription: SubscriptionId,
        error: &BoxedErr,
    ) {
        let _ = (event_type, subscription, error);
    }
}

/// A renderer that draws nothing; useful in tests and headless runs.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn draw_sprite(&mut self, _: TextureId, _: Vec2, _: Vec2, _: f32, _: i32) {}

    fn clear(&mut self) {}

    fn present(&mut self) {}
}
