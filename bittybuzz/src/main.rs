use std::{fs, path::PathBuf, process, sync::Arc, thread};

use bittybuzz::{
    Builtin, HeapSettings, MESSAGE_SIZE, NeighborData, ObjType, SenseBarrier, StringId,
    Vm, VmCreateInfo, VmState, disassemble,
};
use clap::{Args, Parser as ClapParser, Subcommand};
use parking_lot::Mutex;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print the disassembled image instead of running it
    #[arg(long, global = true)]
    dump: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single robot
    Run {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        robot: u16,
        #[command(flatten)]
        vm: VmArgs,
    },
    /// Run a swarm of robots on a line, sharing one radio medium
    Sim {
        image: PathBuf,
        #[arg(long, default_value_t = 4)]
        robots: u16,
        /// Radio and sensor range, in spacings between robots
        #[arg(long, default_value_t = 1)]
        range: u16,
        #[command(flatten)]
        vm: VmArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct VmArgs {
    /// Control cycles to run after `init`
    #[arg(long, default_value_t = 100)]
    ticks: u32,
    #[arg(long, default_value_t = HeapSettings::default().size)]
    heap_size: usize,
    #[arg(long, default_value_t = VmCreateInfo::default().stack_size)]
    stack_size: usize,
}

impl VmArgs {
    fn create_info(&self, robot: u16) -> VmCreateInfo {
        VmCreateInfo {
            robot,
            heap: HeapSettings {
                size: self.heap_size,
            },
            stack_size: self.stack_size,
            ..Default::default()
        }
    }
}

/// Distance between neighboring robots on the line, in sensor units.
const SPACING: u16 = 10;

/// Shared radio: one inbox of raw payloads per robot.
#[derive(Debug)]
struct Medium {
    inboxes: Vec<Vec<Vec<u8>>>,
}

fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let path = match &cli.command {
        Command::Run { image, .. } | Command::Sim { image, .. } => image,
    };
    let image = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading image '{}': {}", path.display(), err);
            process::exit(1);
        }
    };

    if cli.dump {
        match disassemble(&image) {
            Ok(listing) => print!("{listing}"),
            Err(err) => {
                eprintln!("Error decoding image '{}': {}", path.display(), err);
                process::exit(1);
            }
        }
        return;
    }

    let ok = match cli.command {
        Command::Run { robot, vm, .. } => run_single(image, robot, &vm),
        Command::Sim {
            robots, range, vm, ..
        } => run_swarm(image, robots, range, &vm),
    };
    if !ok {
        process::exit(1);
    }
}

fn boot(image: Vec<u8>, info: &VmCreateInfo) -> Option<Vm> {
    let mut vm = match Vm::new(info) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("robot {}: {}", info.robot, err);
            return None;
        }
    };
    if let Err(err) = vm.set_bytecode(image) {
        eprintln!("robot {}: {}", info.robot, err);
        return None;
    }
    if vm.execute_script() == VmState::Error {
        return None;
    }
    if !call_if_defined(&mut vm, Builtin::Init.id()) {
        return None;
    }
    Some(vm)
}

/// Call the global function `name` when the script defines one. Returns
/// false once the VM is in the error state.
fn call_if_defined(vm: &mut Vm, name: StringId) -> bool {
    let defined = vm
        .global(name)
        .is_ok_and(|f| vm.heap().obj_type(f) == ObjType::Closure);
    if defined {
        // failures reach the error receiver
        let _ = vm.function_call(name, &[]);
    }
    vm.state() != VmState::Error
}

fn report(vm: &Vm) {
    let stats = vm.heap().stats();
    log::info!(
        "robot {}: {:?}, {} objects, {} segments, {} bytes free",
        vm.robot(),
        vm.state(),
        stats.objects,
        stats.segments,
        stats.free_bytes
    );
}

fn run_single(image: Vec<u8>, robot: u16, args: &VmArgs) -> bool {
    let Some(mut vm) = boot(image, &args.create_info(robot)) else {
        return false;
    };
    let mut ok = true;
    for _ in 0..args.ticks {
        vm.process_inmsgs();
        if !call_if_defined(&mut vm, Builtin::Step.id()) {
            ok = false;
            break;
        }
        vm.process_outmsgs();
        // nobody listens, drop whatever was sent
        vm.outmsgs_mut().clear();
    }
    report(&vm);
    ok
}

fn in_range(a: u16, b: u16, range: u16) -> bool {
    a != b && a.abs_diff(b) <= range
}

fn run_swarm(image: Vec<u8>, robots: u16, range: u16, args: &VmArgs) -> bool {
    let medium = Arc::new(Mutex::new(Medium {
        inboxes: vec![Vec::new(); robots as usize],
    }));
    let barrier = Arc::new(SenseBarrier::new(robots as usize));
    let image = Arc::new(image);

    let handles: Vec<_> = (0..robots)
        .map(|robot| {
            let medium = Arc::clone(&medium);
            let barrier = Arc::clone(&barrier);
            let image = Arc::clone(&image);
            let args = args.clone();
            thread::spawn(move || {
                robot_thread(robot, robots, range, &image, &args, &medium, &barrier)
            })
        })
        .collect();

    let mut ok = true;
    for handle in handles {
        ok &= handle.join().unwrap_or(false);
    }
    ok
}

fn robot_thread(
    robot: u16,
    robots: u16,
    range: u16,
    image: &[u8],
    args: &VmArgs,
    medium: &Mutex<Medium>,
    barrier: &SenseBarrier,
) -> bool {
    let mut vm = boot(image.to_vec(), &args.create_info(robot));
    let mut buf = [0u8; MESSAGE_SIZE];

    for _ in 0..args.ticks {
        // every robot has sent last tick's messages
        barrier.wait();
        let inbox = std::mem::take(&mut medium.lock().inboxes[robot as usize]);
        barrier.wait();

        // a failed robot keeps joining the barrier so the others can finish
        let Some(vm) = vm.as_mut().filter(|vm| vm.state() != VmState::Error) else {
            continue;
        };

        vm.neighbors_reset();
        for other in (0..robots).filter(|&other| in_range(robot, other, range)) {
            vm.neighbors_add(NeighborData {
                robot: other,
                distance: (robot.abs_diff(other) * SPACING).min(u8::MAX as u16) as u8,
                azimuth: if other > robot { 0 } else { 128 },
                elevation: 0,
            });
        }
        for payload in &inbox {
            if vm.inmsg_append(payload).is_err() {
                log::warn!("robot {robot}: no memory for incoming message");
            }
        }
        vm.process_inmsgs();
        call_if_defined(vm, Builtin::Step.id());
        vm.process_outmsgs();

        let mut outgoing = Vec::new();
        while !vm.outmsgs().is_empty() {
            if let Some(len) = vm.outmsgs().first_into(&mut buf) {
                outgoing.push(buf[..len].to_vec());
            }
            vm.outmsgs_mut().next();
        }
        if !outgoing.is_empty() {
            let mut medium = medium.lock();
            for other in (0..robots).filter(|&other| in_range(robot, other, range)) {
                medium.inboxes[other as usize].extend(outgoing.iter().cloned());
            }
        }
    }

    match vm {
        Some(vm) => {
            report(&vm);
            vm.state() != VmState::Error
        }
        None => false,
    }
}
