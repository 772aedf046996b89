//! Ayumi CLI - コマンドラインインターフェース
//!
//! 模擬ターゲット上でステップ実行エンジンを動かすREPL

use anyhow::{bail, Result};
use ayumi_core::parse::{parse_address, parse_range};
use ayumi_core::{
    should_report_stop, Command, DescriptionLevel, ResumeRequest, StepOutOptions,
    StepRangeOptions, SysVX86_64, ThreadController,
};
use ayumi_target::sim::{CallOptions, SimMemory, SimThread};
use ayumi_target::{
    BreakpointId, BreakpointSiteList, BreakpointSites, SharedSites, ThreadState, TypeKind,
    ValueType,
};
use clap::Parser;
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Ayumi - stepping engine driven over a simulated target
#[derive(Parser)]
#[command(name = "ayumi")]
#[command(version = "0.1.0")]
#[command(about = "Thread plan based execution control over a simulated target", long_about = None)]
struct Cli {
    /// Name of the function the thread starts in
    #[arg(long, default_value = "main")]
    entry: String,

    /// Thread ID of the simulated thread
    #[arg(long, default_value_t = 1)]
    tid: u64,

    /// Let other threads run while this thread steps
    #[arg(long)]
    run_others: bool,

    /// Allow step out to stop in frames without debug info
    #[arg(long)]
    stop_in_nodebug: bool,

    /// Log filter (overridden by AYUMI_LOG)
    #[arg(long, default_value = "warn")]
    log: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    println!("Ayumi - Execution Control Engine");
    println!("Version 0.1.0");
    println!();

    let mut session = Session::new(&cli);
    run_repl(&mut session)?;

    Ok(())
}

/// ログ出力を初期化する
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_env("AYUMI_LOG")
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// 模擬スレッドとそのコントローラをまとめたセッション
struct Session {
    thread: SimThread,
    list: Arc<Mutex<BreakpointSiteList<SimMemory>>>,
    controller: ThreadController,
    /// 実行中なら再開時の要求
    running: Option<ResumeRequest>,
    stop_others: bool,
}

impl Session {
    fn new(cli: &Cli) -> Self {
        let list = BreakpointSiteList::new(SimMemory::new()).into_shared();
        let sites: SharedSites = list.clone();
        let controller = ThreadController::new(cli.tid, sites).with_abi(Arc::new(SysVX86_64));

        let mut thread = SimThread::new(cli.tid, &cli.entry);
        thread.settings_mut().step_out_avoids_no_debug = !cli.stop_in_nodebug;

        Self {
            thread,
            list,
            controller,
            running: None,
            stop_others: !cli.run_others,
        }
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.running.is_some() {
            bail!("Thread is running; advance the target with call/ret/tick");
        }
        Ok(())
    }

    /// スレッドを再開する
    fn resume(&mut self) -> ResumeRequest {
        let request = self.controller.will_resume(&self.thread);
        tracing::debug!(
            "Resuming thread {} ({}, stop others: {})",
            request.tid,
            request.state,
            request.stop_others
        );
        self.running = Some(request);
        request
    }

    /// ターゲットを進め、停止すればプランに判定させる
    fn advance(&mut self, step: impl FnOnce(&mut SimThread)) {
        let request = match self.running {
            Some(request) => request,
            None => self.resume(),
        };

        step(&mut self.thread);
        let stop = {
            let list = self.list.lock();
            self.thread.settle(&*list, request.state)
        };
        let Some(stop) = stop else {
            println!("Running at 0x{:x}", self.thread.current_pc());
            return;
        };

        let decision = self.controller.should_stop(&self.thread);
        if !decision.should_stop {
            tracing::debug!("Stop for {} not taken, resuming", stop.reason);
            self.resume();
            println!("Running at 0x{:x}", self.thread.current_pc());
            return;
        }

        self.running = None;
        if should_report_stop(&[decision]) {
            println!();
            println!("Thread {} stopped: {}", self.thread.tid(), stop.reason);
        }
        self.print_location();
        if let Some(value) = self.controller.return_value() {
            println!("Value returned: {}", value);
        }
    }

    fn print_location(&self) {
        if let Some(frame) = self.thread.frame_at(0) {
            println!(
                "  0x{:x} in {}",
                frame.pc,
                frame.function_name().unwrap_or("??")
            );
        }
    }

    fn print_breakpoints(&self) {
        let list = self.list.lock();
        let mut any = false;
        for bp in list.all() {
            any = true;
            println!(
                "  {} 0x{:x} {}{}{}",
                bp.id,
                bp.address,
                if bp.enabled { "enabled" } else { "disabled" },
                if bp.internal { " internal" } else { "" },
                bp.kind
                    .as_deref()
                    .map(|k| format!(" ({})", k))
                    .unwrap_or_default()
            );
        }
        if !any {
            println!("No breakpoints");
        }
    }
}

/// 履歴ファイルのパス
fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".ayumi_history"))
}

/// REPLループを実行する
fn run_repl(session: &mut Session) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        // 初回起動時は履歴ファイルがない
        let _ = rl.load_history(path);
    }

    loop {
        let readline = rl.readline("(ayumi) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(session, line) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            tracing::warn!("Failed to save history to {}: {}", path.display(), e);
        }
    }
    session.controller.destroy();
    println!("Goodbye!");
    Ok(())
}

/// コマンドを処理する（終了するなら `true`）
fn handle_command(session: &mut Session, line: &str) -> Result<bool> {
    match Command::parse(line) {
        Some(Command::Help) => print_help(),
        Some(Command::Quit) => return Ok(true),
        Some(Command::Break(loc)) => handle_break(session, &loc)?,
        Some(Command::Delete(id)) => handle_delete(session, id)?,
        Some(Command::Continue) => handle_continue(session)?,
        Some(Command::StepInstruction) => handle_step_instruction(session, false)?,
        Some(Command::NextInstruction) => handle_step_instruction(session, true)?,
        Some(Command::Finish(frame)) => handle_finish(session, frame)?,
        Some(Command::Backtrace) => {
            for line in session.thread.backtrace() {
                println!("{}", line);
            }
        }
        Some(Command::Plans { verbose }) => {
            let level = if verbose {
                DescriptionLevel::Verbose
            } else {
                DescriptionLevel::Full
            };
            println!("{}", session.controller.description(level));
        }
        None => handle_custom_command(session, line)?,
    }
    Ok(false)
}

/// Breakコマンドを処理する
fn handle_break(session: &mut Session, loc: &str) -> Result<()> {
    let addr = match parse_address(loc) {
        Ok(addr) => addr,
        Err(_) => session.thread.entry_address(loc),
    };
    let id = session.list.lock().create_breakpoint(addr, false)?;
    println!("Breakpoint {} set at 0x{:x}", id, addr);
    Ok(())
}

/// Deleteコマンドを処理する
fn handle_delete(session: &mut Session, id: u32) -> Result<()> {
    let id = BreakpointId(id);
    let mut list = session.list.lock();
    match list.breakpoint(id).map(|bp| bp.internal) {
        Some(true) => bail!("Breakpoint {} is owned by a thread plan", id),
        Some(false) => list.remove_breakpoint(id)?,
        None => bail!("No breakpoint {}", id),
    }
    println!("Deleted breakpoint {}", id);
    Ok(())
}

/// Continueコマンドを処理する
fn handle_continue(session: &mut Session) -> Result<()> {
    session.ensure_stopped()?;
    let request = session.resume();
    println!("Continuing ({})...", request.state);
    Ok(())
}

/// stepi / nexti を処理する
fn handle_step_instruction(session: &mut Session, step_over: bool) -> Result<()> {
    session.ensure_stopped()?;
    session
        .controller
        .step_instruction(&session.thread, step_over, session.stop_others)?;
    session.resume();
    Ok(())
}

/// Finishコマンドを処理する
fn handle_finish(session: &mut Session, frame: usize) -> Result<()> {
    session.ensure_stopped()?;
    let options = StepOutOptions {
        stop_others: session.stop_others,
        ..StepOutOptions::default()
    };
    session.controller.step_out(&session.thread, frame, options)?;
    println!(
        "{}",
        session.controller.description(DescriptionLevel::Full)
    );
    session.resume();
    Ok(())
}

/// ターゲットを進めるコマンドなど、エンジン以外のコマンドを処理する
fn handle_custom_command(session: &mut Session, line: &str) -> Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, args)) = parts.split_first() else {
        return Ok(());
    };

    match name {
        "call" => {
            let (func, options) = parse_call(args)?;
            session.advance(|t| t.call(func, options));
        }
        "ret" => {
            let value = args.first().map(|v| parse_value(v)).transpose()?;
            if session.thread.depth() <= 1 {
                bail!("Cannot return from the outermost frame");
            }
            session.advance(|t| t.ret(value));
        }
        "tick" | "insn" => session.advance(SimThread::step_instruction),
        "inline" => {
            session.ensure_stopped()?;
            let (Some(func), Some(range)) = (args.first(), args.get(1)) else {
                bail!("Usage: inline <name> <start..end>");
            };
            let range = parse_range(range)?;
            if !range.contains(session.thread.current_pc()) {
                bail!("Range {} does not contain the current pc", range);
            }
            session.thread.enter_inline(func, vec![range]);
            session.print_location();
        }
        "range" => {
            session.ensure_stopped()?;
            let ranges = args
                .iter()
                .map(|r| parse_range(r))
                .collect::<Result<Vec<_>>>()?;
            let options = StepRangeOptions {
                stop_others: session.stop_others,
                ..StepRangeOptions::default()
            };
            session
                .controller
                .step_over_range(&session.thread, &ranges, options)?;
            session.resume();
        }
        "discard" => {
            let count = session.controller.discard_plans();
            println!("Discarded {} plan(s)", count);
        }
        "breakpoints" | "info" => session.print_breakpoints(),
        "completed" => {
            for plan in session.controller.completed_plans() {
                println!(
                    "  [{}] {}{}: {}",
                    plan.id,
                    plan.kind,
                    if plan.private { " (private)" } else { "" },
                    plan.description
                );
            }
        }
        _ => {
            println!("Unknown command: {}", line);
            println!("Type 'help' for available commands.");
        }
    }
    Ok(())
}

/// `call <name> [--nodebug] [--ret <type>]` の引数をパースする
fn parse_call<'a>(args: &[&'a str]) -> Result<(&'a str, CallOptions)> {
    let Some((&func, rest)) = args.split_first() else {
        bail!("Usage: call <name> [--nodebug] [--ret <type>]");
    };

    let mut options = CallOptions::default();
    let mut iter = rest.iter();
    while let Some(&arg) = iter.next() {
        match arg {
            "--nodebug" => options.no_debug = true,
            "--ret" => {
                let Some(ty) = iter.next() else {
                    bail!("--ret needs a type");
                };
                options.return_type = Some(parse_value_type(ty)?);
            }
            other => bail!("Unknown option '{}'", other),
        }
    }
    Ok((func, options))
}

/// 戻り値の型名をパースする
fn parse_value_type(name: &str) -> Result<ValueType> {
    let (kind, size) = match name {
        "void" => (TypeKind::Void, 0),
        "bool" => (TypeKind::Bool, 1),
        "i8" => (TypeKind::Integer { signed: true }, 1),
        "i16" => (TypeKind::Integer { signed: true }, 2),
        "i32" => (TypeKind::Integer { signed: true }, 4),
        "i64" => (TypeKind::Integer { signed: true }, 8),
        "u8" => (TypeKind::Integer { signed: false }, 1),
        "u16" => (TypeKind::Integer { signed: false }, 2),
        "u32" => (TypeKind::Integer { signed: false }, 4),
        "u64" => (TypeKind::Integer { signed: false }, 8),
        "ptr" => (TypeKind::Pointer, 8),
        "f64" => (TypeKind::Float, 8),
        other => bail!("Unknown type '{}'", other),
    };
    Ok(ValueType::new(name, kind, size))
}

/// 戻り値をパースする（負の値は2の補数）
fn parse_value(s: &str) -> Result<u64> {
    match s.strip_prefix('-') {
        Some(abs) => Ok(parse_address(abs)?.wrapping_neg()),
        None => parse_address(s),
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help               - Show this help message");
    println!("  quit/exit/q        - Exit");
    println!();
    println!("Execution control:");
    println!("  break <loc>        - Set breakpoint at function or address");
    println!("  delete <id>        - Delete a user breakpoint");
    println!("  continue (c)       - Resume the thread");
    println!("  stepi (si)         - Step one instruction, into calls");
    println!("  nexti (ni)         - Step one instruction, over calls");
    println!("  finish [frame]     - Step out of the given frame (default 0)");
    println!("  range <a..b> ...   - Step through address ranges, over calls");
    println!("  discard            - Discard all queued plans");
    println!();
    println!("Inspection:");
    println!("  backtrace (bt)     - Show frames");
    println!("  plans [-v]         - Show the plan stack");
    println!("  completed          - Show plans completed at the last stop");
    println!("  breakpoints        - List breakpoints, internal ones included");
    println!();
    println!("Simulated target:");
    println!("  call <name> [--nodebug] [--ret <type>]");
    println!("                     - Call a function");
    println!("  ret [value]        - Return from the current function");
    println!("  tick (insn)        - Execute one instruction");
    println!("  inline <name> <a..b>");
    println!("                     - Enter an inlined block at the current pc");
    println!();
    println!("Examples:");
    println!("  call compute");
    println!("  call leaf --ret i32");
    println!("  finish");
    println!("  ret 42");
}
