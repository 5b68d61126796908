extern crate iohpm;

use iohpm::sim::SimRegisters;
use iohpm::{BankConfig, GlobalRegistry, RequestConfig, SampleAction};

fn main() {
	env_logger::init();

	// A software model of an 8-counter bank with 32-bit counters.
	let sim = SimRegisters::new(8, 0xffff_ffff);
	let bank = BankConfig::default()
		.dev_name("demo")
		.num_counters(8)
		.counter_mask(0xffff_ffff)
		.build(sim.clone(), GlobalRegistry)
		.unwrap();

	// Sample every 5000 IOTLB misses, stop after 4 samples
	let misses = RequestConfig::default()
		.sample_period(5000)
		.init(&bank, "tlb_miss")
		.unwrap();
	let miss_slot = bank.open(&misses, true).unwrap();

	// Count page-table walks without sampling
	let walks = RequestConfig::default().init(&bank, "g_pt_walks").unwrap();
	let walk_slot = bank.open(&walks, true).unwrap();

	let mut samples = 0;
	for i in 1..=100 {
		// do some translations...
		sim.advance(miss_slot, 317);
		sim.advance(walk_slot, 41);

		if !sim.take_irq() {
			continue;
		}

		bank.handle_irq(&i, |req, sample, round| {
			samples += 1;
			println!(
				"round {}: {} sample on counter {} after {} events",
				round,
				req.config(),
				sample.slot,
				sample.period
			);

			if samples == 4 {
				SampleAction::Stop
			} else {
				SampleAction::Continue
			}
		});
	}

	println!("tlb misses: {} ({:?})", bank.read(&misses), misses.state());
	println!("g-stage walks: {}", bank.read(&walks));

	bank.close(&misses);
	bank.close(&walks);
}
