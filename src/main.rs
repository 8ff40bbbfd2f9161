use anyhow::{Context, Result};

use kernos::kernel::INIT_PROGRAM;
use kernos::{Machine, MachineConfig, Program, StopReason};

/// Boot the machine with an init image and run it to completion.
///
/// Usage: `kernos [init-image] [instruction-budget]`
/// - `init-image` defaults to `init.maq` in the working directory.
/// - `instruction-budget` defaults to 1,000,000.
///
/// Programs spawned by name resolve against the working directory.
fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let image_path = args.next().unwrap_or_else(|| INIT_PROGRAM.to_string());
    let budget: u64 = match args.next() {
        Some(s) => s
            .parse()
            .with_context(|| format!("instruction budget '{s}' is not a number"))?,
        None => 1_000_000,
    };

    let program =
        Program::from_file(&image_path).with_context(|| format!("loading '{image_path}'"))?;

    let mut machine = Machine::new(MachineConfig::default());
    machine.register_program(INIT_PROGRAM, program);
    machine.boot();
    let stop = machine.run(budget);

    let executed = machine.hardware().clock.instructions();
    match stop {
        StopReason::Halted => println!("machine halted after {executed} instructions"),
        StopReason::BudgetExhausted => {
            println!("instruction budget ({budget}) exhausted; {} processes alive",
                machine.kernel().process_count())
        }
    }
    for slot in 0..machine.console().slot_count() {
        let out = machine.console().output(slot);
        if !out.is_empty() {
            println!("terminal {slot}: {out:?}");
        }
    }
    Ok(())
}
