//! Headless pipeline: loads a JSON layout, runs it, prints what the sinks
//! received and checks that a second run hashes the same.
//!
//! Run with: `cargo run --package pipeworks-core --example headless_pipeline [layout.json]`

use pipeworks_core::event::Event;
use pipeworks_core::layout::load_layout_json;

const FRAMES: usize = 600;
const FRAME_MS: f64 = 16.0;

const DEFAULT_LAYOUT: &str = r#"{
    "width": 9, "height": 1,
    "belts": [
        { "x": 1, "y": 0, "direction": "right" },
        { "x": 3, "y": 0, "direction": "right" },
        { "x": 5, "y": 0, "direction": "right" },
        { "x": 7, "y": 0, "direction": "right" }
    ],
    "machines": [
        { "x": 0, "y": 0, "type": "source", "text": "Hello, pipes!\n", "interval_ms": 120 },
        { "x": 2, "y": 0, "type": "math", "op": "xor", "operand": 32 },
        { "x": 4, "y": 0, "type": "filter", "byte": "!", "mode": "block" },
        { "x": 6, "y": 0, "type": "display" },
        { "x": 8, "y": 0, "type": "sink" }
    ]
}"#;

fn main() {
    let json = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path).unwrap_or_else(|e| {
            panic!("failed to read layout '{path}': {e}");
        }),
        None => DEFAULT_LAYOUT.to_string(),
    };

    let mut sim = load_layout_json(&json).unwrap_or_else(|e| panic!("bad layout: {e}"));
    println!(
        "Layout: {}x{}, {} machines",
        sim.grid().width(),
        sim.grid().height(),
        sim.machine_count()
    );

    sim.start();
    let stats = sim.run_frames(FRAMES, FRAME_MS);
    println!(
        "After {FRAMES} frames: emitted={}, consumed={}, orphaned={}, in flight={}",
        stats.emitted,
        stats.consumed,
        stats.orphaned,
        sim.packets().len()
    );

    for event in sim.drain_events() {
        if let Event::DisplayFlushed { text, .. } = event {
            println!("    display: {text:?}");
        }
    }

    for (id, machine) in sim.machines() {
        if let Some(contents) = machine.sink_contents() {
            println!(
                "    sink {id:?} at ({}, {}): {:?}",
                machine.x,
                machine.y,
                contents.concat()
            );
        }
    }

    // Second run, determinism check.
    let hash1 = sim.state_hash();
    let mut again = load_layout_json(&json).unwrap_or_else(|e| panic!("bad layout: {e}"));
    again.start();
    again.run_frames(FRAMES, FRAME_MS);
    let hash2 = again.state_hash();
    if hash1 == hash2 {
        println!("Determinism: PASS ({hash1:#018x})");
    } else {
        println!("Determinism: FAIL! {hash1:#018x} != {hash2:#018x}");
        std::process::exit(1);
    }
}
