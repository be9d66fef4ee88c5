use std::io::Cursor;

use clap::Parser;

use crate::base::{AccessKind, MemoryReference};
use crate::sim::config::{
    CacheKnobs, DeviceKind, DeviceRole, DeviceSpec, HierarchyConfig, PatternKind, SimConfig,
    SyntheticConfig, TlbKnobs,
};
use crate::sim::page_table::{PageTable, PageTableEntry};
use crate::sim::perf_log;
use crate::sim::simulator::CacheSimulator;
use crate::sim::synthetic::SyntheticTrace;
use crate::sim::top::Sim;
use crate::sim::trace::TraceReader;
use crate::ui::{load_config, MemhierArgs};

const LINE: u64 = 64;

/// Two cores, 8-set 2-way L1s, no L2, 16-set 4-way LLC.
fn small_knobs() -> CacheKnobs {
    CacheKnobs {
        num_cores: 2,
        line_size: LINE,
        l1i_size: 1024,
        l1i_assoc: 2,
        l1d_size: 1024,
        l1d_assoc: 2,
        l2_size: 0,
        llc_size: 4096,
        llc_assoc: 4,
        ..CacheKnobs::default()
    }
}

fn knob_sim(sim: &SimConfig) -> CacheSimulator {
    CacheSimulator::from_knobs(&small_knobs(), &TlbKnobs::default(), sim).unwrap()
}

fn load(core: usize, addr: u64) -> MemoryReference {
    MemoryReference::load(core, addr)
}

fn gva(core: usize, addr: u64) -> MemoryReference {
    MemoryReference::new(AccessKind::TranslateGva, core, 1, addr)
}

fn device(name: &str, kind: DeviceKind, size: u64, assoc: usize) -> DeviceSpec {
    DeviceSpec {
        name: name.to_string(),
        kind,
        size,
        assoc,
        block_size: if kind == DeviceKind::Tlb { 4096 } else { LINE },
        ..DeviceSpec::default()
    }
}

fn first_level(mut spec: DeviceSpec, core: usize, role: DeviceRole, parent: &str) -> DeviceSpec {
    spec.core = Some(core);
    spec.role = role;
    spec.parent = Some(parent.to_string());
    spec
}

/// Core 0 with a unified 1-set 2-way L1 under a 1-set 4-way LL.
fn tiny_hierarchy() -> HierarchyConfig {
    HierarchyConfig {
        devices: vec![
            first_level(device("L1", DeviceKind::Cache, 128, 2), 0, DeviceRole::Unified, "LL"),
            device("LL", DeviceKind::Cache, 256, 4),
        ],
    }
}

#[test]
fn knob_topology_names_and_parents() {
    let sim = knob_sim(&SimConfig::default());
    let devices = sim.devices();
    assert_eq!(sim.num_cores(), 2);
    // LL, 2 x (L1I, L1D), TLB_L2, 2 x TLB_L1
    assert_eq!(devices.len(), 8);
    let ll = devices.find("LL").unwrap();
    for name in ["L1_I_core0", "L1_D_core0", "L1_I_core1", "L1_D_core1"] {
        assert_eq!(sim.device(name).unwrap().parent(), Some(ll));
    }
    let tlb_l2 = devices.find("TLB_L2").unwrap();
    assert_eq!(sim.device("TLB_L1_core1").unwrap().parent(), Some(tlb_l2));
    assert!(sim.device("TLB_L2").unwrap().parent().is_none());
}

#[test]
fn private_l2_sits_between_l1_and_llc() {
    let knobs = CacheKnobs {
        l2_size: 2048,
        l2_assoc: 4,
        ..small_knobs()
    };
    let sim = CacheSimulator::from_knobs(&knobs, &TlbKnobs::default(), &SimConfig::default()).unwrap();
    let l2 = sim.devices().find("L2_core1").unwrap();
    assert_eq!(sim.device("L1_D_core1").unwrap().parent(), Some(l2));
    assert_eq!(sim.device("L2_core1").unwrap().parent(), sim.devices().find("LL"));
}

#[test]
fn disabled_tlbs_reject_translations() {
    let tlb = TlbKnobs {
        enabled: false,
        ..TlbKnobs::default()
    };
    let mut sim = CacheSimulator::from_knobs(&small_knobs(), &tlb, &SimConfig::default()).unwrap();
    assert!(sim.device("TLB_L2").is_none());
    assert!(!sim.process_memref(&gva(0, 0x4000_0000)));
    assert_eq!(sim.failed_refs(), 1);
    assert_eq!(sim.refs_processed(), 0);
}

#[test]
fn loads_and_fetches_route_to_their_core() {
    let mut sim = knob_sim(&SimConfig::default());
    assert!(sim.process_memref(&load(1, 0x1000)));
    assert!(sim.process_memref(&load(1, 0x1008)));
    assert!(sim.process_memref(&MemoryReference::new(AccessKind::Instruction, 0, 1, 0x40_0000)));

    let l1d = sim.device("L1_D_core1").unwrap().stats();
    assert_eq!((l1d.hits(), l1d.misses()), (1, 1));
    let l1i = sim.device("L1_I_core0").unwrap().stats();
    assert_eq!((l1i.hits(), l1i.misses()), (0, 1));
    assert_eq!(sim.device("L1_D_core0").unwrap().stats().accesses(), 0);

    // two misses reached the LLC; the L1 hit was reported as a child hit
    let ll = sim.device("LL").unwrap().stats();
    assert_eq!(ll.misses(), 2);
    assert_eq!(ll.child_misses(), 2);
    assert_eq!(ll.child_hits(), 1);
}

#[test]
fn unknown_core_is_reported_not_fatal() {
    let mut sim = knob_sim(&SimConfig::default());
    assert!(!sim.process_memref(&load(7, 0x1000)));
    assert!(sim.process_memref(&load(0, 0x1000)));
    assert_eq!(sim.failed_refs(), 1);
    assert_eq!(sim.refs_processed(), 1);
}

#[test]
fn translations_feed_the_walk_histogram() {
    let mut sim = knob_sim(&SimConfig::default());
    sim.process_memref(&gva(0, 0x4000_0000));
    sim.process_memref(&gva(0, 0x4000_0010));
    // same page from another core: its L1 TLB misses, the shared L2 hits
    sim.process_memref(&gva(1, 0x4000_0020));

    let walks = sim.walk_histogram();
    assert_eq!(walks.count(&[false, false]), 1);
    assert_eq!(walks.count(&[true]), 1);
    assert_eq!(walks.count(&[false, true]), 1);
    assert_eq!(walks.total(), 3);
}

#[test]
fn full_tlb_miss_walks_the_page_table_through_l1d() {
    let mut sim = knob_sim(&SimConfig::default());
    let mut table = PageTable::new(4096).unwrap();
    // entries land in distinct L1D sets
    table.insert(PageTableEntry {
        va: 0x4000_0000,
        entries: [0x9000_0000, 0x9000_0040, 0x9000_0080, 0x9000_00c0],
        pa: 0x1_0000_0000,
    });
    table.insert(PageTableEntry {
        va: 0x4000_1000,
        entries: [0x9000_0000, 0x9000_0040, 0x9000_0080, 0x9000_0100],
        pa: 0x1_0000_1000,
    });
    sim.set_page_table(table);

    sim.process_memref(&gva(0, 0x4000_0000));
    // TLB hit: no walk
    sim.process_memref(&gva(0, 0x4000_0008));
    sim.process_memref(&gva(0, 0x4000_1000));
    sim.process_memref(&gva(0, 0x5000_0000));

    let pte = sim.pte_walk_histogram();
    assert_eq!(pte.total(), 2);
    assert_eq!(pte.count(&[false, false, false, false]), 1);
    assert_eq!(pte.count(&[true, true, true, false]), 1);
    let levels = sim.pte_levels();
    assert_eq!((levels[0].hits, levels[0].misses), (1, 1));
    assert_eq!((levels[3].hits, levels[3].misses), (0, 2));
    assert_eq!(sim.unmapped_walks(), 1);
    assert_eq!(sim.device("L1_D_core0").unwrap().stats().accesses(), 8);
}

#[test]
fn warmup_by_reference_count_resets_stats() {
    let config = SimConfig {
        warmup_refs: 2,
        sim_refs: 3,
        ..SimConfig::default()
    };
    let mut sim = knob_sim(&config);
    assert!(!sim.check_warmed_up());
    sim.process_memref(&load(0, 0x1000));
    sim.process_memref(&gva(0, 0x4000_0000));
    assert!(sim.is_warmed_up());
    assert_eq!(sim.remaining_sim_refs(), 3);
    assert_eq!(sim.walk_histogram().total(), 0);
    assert_eq!(sim.device("LL").unwrap().stats().accesses(), 0);

    sim.process_memref(&load(0, 0x1000));
    let l1d = sim.device("L1_D_core0").unwrap().stats();
    assert_eq!((l1d.hits(), l1d.misses()), (1, 0));
    assert_eq!(sim.remaining_sim_refs(), 2);
}

#[test]
fn warmup_by_loaded_fraction() {
    let config = SimConfig {
        warmup_fraction: 0.5,
        ..SimConfig::default()
    };
    let mut sim = CacheSimulator::from_hierarchy(&tiny_hierarchy(), &config).unwrap();
    sim.process_memref(&load(0, 0));
    // L1 half full, LL a quarter
    assert!(!sim.is_warmed_up());
    sim.process_memref(&load(0, LINE));
    assert!(sim.is_warmed_up());
    assert_eq!(sim.device("L1").unwrap().stats().accesses(), 0);
    assert_eq!(sim.device("LL").unwrap().loaded_fraction(), 0.5);
}

#[test]
fn no_warmup_starts_warm() {
    let sim = knob_sim(&SimConfig::default());
    assert!(sim.is_warmed_up());
    assert!(sim.check_warmed_up());
}

#[test]
fn rejects_out_of_range_warmup_fraction() {
    let config = SimConfig {
        warmup_fraction: 1.5,
        ..SimConfig::default()
    };
    assert!(CacheSimulator::from_hierarchy(&tiny_hierarchy(), &config).is_err());
}

#[test]
fn hierarchy_builds_children_before_listed_parents() {
    let mut hierarchy = tiny_hierarchy();
    let mut tlb = first_level(device("TLB0", DeviceKind::Tlb, 16, 4), 0, DeviceRole::Unified, "STLB");
    tlb.gpa_ways = Some(1);
    hierarchy.devices.push(tlb);
    hierarchy.devices.push(device("STLB", DeviceKind::Tlb, 64, 8));

    let mut sim = CacheSimulator::from_hierarchy(&hierarchy, &SimConfig::default()).unwrap();
    assert_eq!(sim.num_cores(), 1);
    assert_eq!(sim.page_size(), 4096);
    // a parent always precedes its children in the arena
    for (id, dev) in sim.devices().iter() {
        if let Some(parent) = dev.parent() {
            assert!(parent.index() < id.index());
        }
    }
    assert!(sim.process_memref(&gva(0, 0x4000_0000)));
    assert!(sim.process_memref(&MemoryReference::new(AccessKind::Instruction, 0, 1, 0x40)));
    assert_eq!(sim.device("L1").unwrap().stats().misses(), 1);
    assert_eq!(sim.device("TLB0").unwrap().stats().misses(), 1);
}

#[test]
fn hierarchy_validation_errors() {
    let sim = SimConfig::default();
    let check = |hierarchy: HierarchyConfig, needle: &str| {
        let err = CacheSimulator::from_hierarchy(&hierarchy, &sim).err().unwrap();
        let msg = format!("{err:#}");
        assert!(msg.contains(needle), "'{msg}' does not mention '{needle}'");
    };

    let mut dup = tiny_hierarchy();
    dup.devices.push(device("LL", DeviceKind::Cache, 256, 4));
    check(dup, "duplicate device name");

    let mut unknown = tiny_hierarchy();
    unknown.devices[1].parent = Some("L3".to_string());
    check(unknown, "unknown parent 'L3'");

    let mut cycle = tiny_hierarchy();
    cycle.devices[1].parent = Some("L1".to_string());
    check(cycle, "parent cycle");

    let mut missing = tiny_hierarchy();
    missing
        .devices
        .push(first_level(device("L1I_1", DeviceKind::Cache, 128, 2), 1, DeviceRole::Instruction, "LL"));
    check(missing, "core 1 has no first-level data cache");

    let mut twice = tiny_hierarchy();
    twice
        .devices
        .push(first_level(device("L1D_0", DeviceKind::Cache, 128, 2), 0, DeviceRole::Data, "LL"));
    check(twice, "more than one first-level data cache");

    let mut partitioned_cache = tiny_hierarchy();
    partitioned_cache.devices[1].gpa_ways = Some(1);
    check(partitioned_cache, "gpa_ways only applies to tlb devices");

    let mut mixed = tiny_hierarchy();
    mixed.devices[0].parent = Some("STLB".to_string());
    mixed.devices.push(device("STLB", DeviceKind::Tlb, 64, 8));
    check(mixed, "cannot forward misses");

    let mut policy = tiny_hierarchy();
    policy.devices[1].replace_policy = Some("random".to_string());
    check(policy, "unknown replacement policy");
}

#[test]
fn summary_totals_first_level_devices() {
    let mut sim = knob_sim(&SimConfig::default());
    sim.process_memref(&load(0, 0x1000));
    sim.process_memref(&load(1, 0x1000));
    sim.process_memref(&load(1, 0x1000));
    sim.process_memref(&gva(0, 0x4000_0000));

    let summary = sim.summary();
    assert_eq!(summary.refs_processed, 4);
    assert_eq!(summary.devices.len(), 8);
    assert_eq!(summary.totals.l1d.misses(), 2);
    assert_eq!(summary.totals.l1d.hits(), 1);
    assert_eq!(summary.totals.l1i.accesses(), 0);
    assert_eq!(summary.totals.l1_tlb.misses(), 1);
    assert_eq!(summary.tlb_walks.len(), 1);
    assert_eq!(summary.tlb_walks[0].pattern, "MM");

    let ll = summary.devices.iter().find(|d| d.name == "LL").unwrap();
    assert_eq!(ll.kind, "cache");
    assert!(ll.parent.is_none());
    let tlb = summary.devices.iter().find(|d| d.name == "TLB_L1_core0").unwrap();
    assert_eq!(tlb.parent.as_deref(), Some("TLB_L2"));
}

#[test]
fn results_report_every_device() {
    let mut sim = knob_sim(&SimConfig::default());
    sim.process_memref(&load(0, 0x1000));
    let mut out = Vec::new();
    sim.write_results(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    for name in ["LL", "L1_D_core0", "TLB_L2"] {
        assert!(text.contains(&format!("{name} (")), "{name} missing from:\n{text}");
    }
    assert!(text.contains("TLB walk patterns"));
    // no page table configured
    assert!(!text.contains("Page-table walk patterns"));
}

#[test]
fn summary_json_is_written() {
    let mut sim = knob_sim(&SimConfig::default());
    sim.process_memref(&load(0, 0x1000));
    let dir = std::env::temp_dir().join(format!("memhier-summary-{}", std::process::id()));
    let path = dir.join("out").join("summary.json");
    perf_log::write_summary(&path, &sim.summary()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["refs_processed"], 1);
    assert_eq!(value["devices"].as_array().unwrap().len(), 8);
    assert_eq!(value["totals"]["l1d"]["misses"], 1);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn driver_stops_at_the_reference_budget() {
    let config = SimConfig {
        sim_refs: 10,
        ..SimConfig::default()
    };
    let mut sim = Sim::new(knob_sim(&config), config, None);
    let synthetic = SyntheticConfig {
        refs: 100,
        num_cores: 2,
        ..SyntheticConfig::default()
    };
    let fed = sim.drive(SyntheticTrace::new(synthetic).map(Ok)).unwrap();
    assert_eq!(fed, 10);
    assert_eq!(sim.simulator.remaining_sim_refs(), 0);
}

#[test]
fn driver_replays_a_text_trace() {
    let config = SimConfig::default();
    let mut sim = Sim::new(knob_sim(&config), config, None);
    let text = "0 1 r 0x1000\n0 1 w 0x1008\n1 1 i 0x400000\n0 1 gpa 0x80000000\n";
    let fed = sim.drive(TraceReader::new(Cursor::new(text))).unwrap();
    assert_eq!(fed, 4);
    let l1d = sim.simulator.device("L1_D_core0").unwrap().stats();
    assert_eq!((l1d.hits(), l1d.misses()), (1, 1));
    assert_eq!(sim.simulator.device("L1_I_core1").unwrap().stats().misses(), 1);
    assert_eq!(sim.simulator.device("TLB_L1_core0").unwrap().stats().misses(), 1);
}

#[test]
fn driver_propagates_trace_errors() {
    let config = SimConfig::default();
    let mut sim = Sim::new(knob_sim(&config), config, None);
    let text = "0 1 r 0x1000\nnot a reference\n";
    let err = sim.drive(TraceReader::new(Cursor::new(text))).unwrap_err();
    assert!(format!("{err:#}").contains("trace line 2"));
    assert_eq!(sim.simulator.refs_processed(), 1);
}

const CONFIG: &str = r#"
[sim]
trace = "refs.trace"
warmup_refs = 100

[cache]
num_cores = 2
llc_size = 65536
llc_assoc = 8
replace_policy = "fifo"

[tlb]
static_partition = true
"#;

#[test]
fn config_builds_knob_simulator() {
    let run = load_config(CONFIG, None).unwrap();
    assert!(run.synthetic.is_none());
    assert!(run.hierarchy.is_none());
    let sim = run.build().unwrap();
    assert_eq!(sim.simulator.num_cores(), 2);
    assert_eq!(sim.simulator.device("LL").unwrap().policy().name(), "FIFO");
    assert!(!sim.simulator.is_warmed_up());
}

#[test]
fn cli_overrides_config() {
    let args = MemhierArgs::parse_from([
        "memhier",
        "config.toml",
        "--num-cores",
        "3",
        "--sim-refs",
        "50",
        "--synthetic",
        "hot",
    ]);
    let run = load_config(CONFIG, Some(args)).unwrap();
    assert_eq!(run.cache.num_cores, 3);
    assert_eq!(run.sim.sim_refs, 50);
    let synthetic = run.synthetic.as_ref().unwrap();
    assert_eq!(synthetic.pattern, PatternKind::Hot);
    assert_eq!(synthetic.num_cores, 3);
}

#[test]
fn hierarchy_section_replaces_knobs() {
    let text = r#"
[[hierarchy.devices]]
name = "L1"
kind = "cache"
role = "unified"
core = 0
size = 1024
assoc = 2
parent = "LL"

[[hierarchy.devices]]
name = "LL"
kind = "cache"
size = 8192
assoc = 4
replace_policy = "lfu"
"#;
    let sim = load_config(text, None).unwrap().build().unwrap();
    assert_eq!(sim.simulator.devices().len(), 2);
    assert_eq!(sim.simulator.device("LL").unwrap().policy().name(), "LFU");
    assert!(sim.simulator.device("L1_D_core0").is_none());
}

#[test]
fn bad_config_is_an_error() {
    assert!(load_config("[cache\nnum_cores = 1", None).is_err());
    assert!(load_config("[cache]\nnum_cores = \"four\"", None).is_err());
    let zero = load_config("[cache]\nnum_cores = 0", None).unwrap();
    assert!(zero.build().is_err());
}
