//! Randomized multi-client convergence fuzzing: interleave text edits and
//! interval operations across three clients with delayed delivery, then
//! check every site resolves the identical interval set.

mod harness;

use harness::World;
use interval_collection::IntervalType;
use rand::prelude::*;
use serde_json::json;

fn random_str(len: usize, rng: &mut SmallRng) -> String {
    let alphabet: Vec<char> = "abcdefghijklmnop_".chars().collect();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

fn interval_ids(world: &World, idx: usize) -> Vec<String> {
    world
        .client(idx)
        .collection
        .iter()
        .filter_map(|iv| iv.id().map(|id| id.to_string()))
        .collect()
}

fn make_random_change(world: &mut World, idx: usize, rng: &mut SmallRng) {
    let len = world.client(idx).client.visible_length();
    let ids = interval_ids(world, idx);
    let client = world.client(idx);

    match rng.gen_range(0..10) {
        // Insert some text.
        0..=2 => {
            let pos = rng.gen_range(0..=len);
            let text = random_str(rng.gen_range(1..4), rng);
            client.insert(pos, &text);
        }
        // Remove a range.
        3..=4 if len > 0 => {
            let start = rng.gen_range(0..len);
            let span = rng.gen_range(1..=usize::min(5, len - start));
            client.remove(start, start + span);
        }
        // Add an interval.
        5..=6 if len > 0 => {
            let start = rng.gen_range(0..len) as i64;
            let end = rng.gen_range(start..len as i64);
            client
                .collection
                .add(start, end, IntervalType::SLIDE_ON_REMOVE, None, None)
                .unwrap();
        }
        // Move an interval.
        7 if len > 0 && !ids.is_empty() => {
            let id = &ids[rng.gen_range(0..ids.len())];
            let start = rng.gen_range(0..len) as i64;
            let end = rng.gen_range(start..len as i64);
            client
                .collection
                .change(id, Some(start), Some(end))
                .unwrap();
        }
        // Touch its properties.
        8 if !ids.is_empty() => {
            let id = &ids[rng.gen_range(0..ids.len())];
            let key = format!("k{}", rng.gen_range(0..3));
            let props = [(key.into(), json!(rng.gen_range(0..100)))]
                .into_iter()
                .collect();
            client.collection.change_properties(id, props).unwrap();
        }
        // Delete one.
        9 if !ids.is_empty() => {
            let id = &ids[rng.gen_range(0..ids.len())];
            client.collection.remove_interval_by_id(id);
        }
        _ => {
            let pos = rng.gen_range(0..=len);
            client.insert(pos, "z");
        }
    }
    // Submit immediately, like a connected client; delivery lags behind.
    world.sequence_from(idx);
}

#[test]
fn random_ops_converge() {
    for seed in 0..12u64 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut world = World::new(&["A", "B", "C"]);

        // Seed some shared text so early interval ops have room.
        world.client(0).insert(0, "abcdefgh");
        world.settle();

        for _round in 0..80 {
            let idx = rng.gen_range(0..3);
            make_random_change(&mut world, idx, &mut rng);
            if rng.gen_bool(0.2) {
                world.deliver_all();
            }
        }

        world.deliver_all();
        world.assert_converged();
        for idx in 0..3 {
            world.client(idx).collection.check();
        }
    }
}
