//! argon entry point: flags, terminal handling, the stdin pump, and one
//! host thread per vCPU.

use argon::machine::{self, Machine};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use vmm_sys_util::terminal::Terminal;

/// Ctrl-A starts the escape sequence; Ctrl-A x detaches and terminates.
const ESCAPE_BYTE: u8 = 0x01;

#[derive(Parser, Debug)]
#[command(name = "argon")]
#[command(about = "A minimal KVM virtual machine monitor that boots Linux")]
struct Args {
    /// Path to the kernel bzImage
    #[arg(long)]
    kernel: PathBuf,

    /// Path to the initial RAM disk
    #[arg(long)]
    initrd: PathBuf,

    /// Kernel command line
    #[arg(
        long,
        default_value = "console=ttyS0 earlyprintk=serial noapic noacpi notsc \
                         lapic pci=realloc=off virtio_pci.force_legacy=1 rdinit=/init"
    )]
    params: String,

    /// Host TAP interface backing virtio-net (omit to run without a NIC)
    #[arg(long)]
    tap: Option<String>,

    /// Raw disk image backing virtio-blk (omit to run without a disk)
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Number of virtual CPUs
    #[arg(long, default_value_t = 1)]
    cpus: usize,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => {
            restore_terminal();
            ExitCode::SUCCESS
        }
        Err(e) => {
            restore_terminal();
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), machine::Error> {
    let machine = Arc::new(Machine::new(
        args.cpus,
        machine::DEFAULT_MEM_SIZE,
        args.tap.as_deref(),
        args.disk.as_deref(),
    )?);

    machine.load_linux(&args.kernel, &args.initrd, &args.params)?;

    let mut vcpu_threads = Vec::with_capacity(args.cpus);
    for cpu in 0..args.cpus {
        log::info!("starting cpu {cpu} of {}", args.cpus);
        let machine = Arc::clone(&machine);
        let handle = thread::Builder::new()
            .name(format!("vcpu{cpu}"))
            .spawn(move || machine.run_infinite_loop(cpu))
            .expect("spawn vcpu thread");
        vcpu_threads.push(handle);
    }

    start_stdin_pump(Arc::clone(&machine));

    let mut result = Ok(());
    for (cpu, handle) in vcpu_threads.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => log::info!("cpu {cpu} exited"),
            // The guest asked for a reboot; that is a clean shutdown for
            // a VMM without persistent machine state.
            Ok(Err(machine::Error::PowerCycle)) => log::info!("cpu {cpu}: power cycle"),
            Ok(Err(e)) => {
                log::error!("cpu {cpu}: {e}");
                result = Err(e);
            }
            Err(_) => result = Err(machine::Error::UnexpectedExit(format!(
                "vcpu {cpu} thread panicked"
            ))),
        }
    }
    result
}

/// Forward host stdin to the guest serial port, byte by byte, injecting
/// IRQ 4 for each one. Recognizes Ctrl-A x as detach-and-terminate.
fn start_stdin_pump(machine: Arc<Machine>) {
    thread::Builder::new()
        .name("stdin-pump".into())
        .spawn(move || {
            let stdin = std::io::stdin();

            if stdin_is_tty() {
                if let Err(e) = stdin.lock().set_raw_mode() {
                    log::warn!("failed to set raw mode: {e}");
                }
            } else {
                log::info!("stdin is not a terminal; serial input disabled at EOF");
            }

            let mut previous = 0u8;
            let mut buf = [0u8; 1];
            loop {
                match stdin.lock().read(&mut buf) {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let byte = buf[0];
                        machine.queue_serial_input(byte);
                        if let Err(e) = machine.inject_serial_irq() {
                            log::warn!("serial irq injection failed: {e}");
                        }

                        if previous == ESCAPE_BYTE && byte == b'x' {
                            log::info!("detach requested, terminating");
                            restore_terminal();
                            std::process::exit(0);
                        }
                        previous = byte;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::warn!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        })
        .expect("spawn stdin pump thread");
}

fn stdin_is_tty() -> bool {
    // SAFETY: isatty on a constant fd has no preconditions.
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

fn restore_terminal() {
    if stdin_is_tty() {
        let _ = std::io::stdin().lock().set_canon_mode();
    }
}
