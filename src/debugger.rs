//! Terminal debugger: a `termion`-drawn register/disassembly panel plus a
//! single-letter stdin command loop (step/continue/breakpoint/jump/watch),
//! built around the Alpha CPU's PC/integer-register state. Only ever drives
//! one CPU (see DESIGN.md).

use crate::cpu::Cpu;
use crate::devices::Signal;
use crate::fabric::{HostFabric, MemoryFabric, Width};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::{self, Write};
use termion::{clear, color, cursor};

/// One fetched word per disassembly line: its address, the raw 32-bit
/// instruction, and a short decoded description.
pub type DisassemblySection = VecDeque<(u64, u32, String)>;

fn fetch_words(fabric: &HostFabric, start: u64, count: usize) -> DisassemblySection {
    let mut lines = DisassemblySection::with_capacity(count);
    for i in 0..count {
        let address = start + (i as u64) * 4;
        let word = fabric.read(address, Width::Long) as u32;
        let instr = crate::cpu::decode::decode(word);
        let text = format!(
            "{:?} ra={} rb={} rc={} disp={}",
            crate::cpu::decode::group(instr.opcode),
            instr.ra,
            instr.rb,
            instr.rc,
            instr.disp
        );
        lines.push_back((address, word, text));
    }
    lines
}

/// Tracks which window of fetched instructions is on screen and where the
/// CPU's PC currently falls within it, re-scrolling only when the PC walks
/// off the visible half.
pub struct Disassembly {
    pub lines: DisassemblySection,
    pub cursor: usize,
    pub length: usize,
    pub breakpoints: HashSet<u64>,
}

impl Disassembly {
    pub fn new(length: usize) -> Self {
        Disassembly { lines: DisassemblySection::new(), cursor: 0, length, breakpoints: HashSet::new() }
    }

    pub fn update(&mut self, cpu: &Cpu, fabric: &HostFabric) {
        if self.lines.is_empty() {
            self.lines = fetch_words(fabric, cpu.pc, self.length);
            self.cursor = 0;
        }
        let mut found = None;
        for (i, line) in self.lines.iter().enumerate() {
            if line.0 == cpu.pc {
                found = Some(i);
                break;
            }
        }
        match found {
            Some(i) => self.cursor = i,
            None => {
                self.lines = fetch_words(fabric, cpu.pc, self.length);
                self.cursor = 0;
            }
        }
        if self.cursor >= self.length / 2 && self.lines.len() == self.length {
            self.lines.pop_front();
            let next_address = self.lines.back().map(|l| l.0 + 4).unwrap_or(cpu.pc);
            self.lines.extend(fetch_words(fabric, next_address, 1));
            self.cursor = self.cursor.saturating_sub(1);
        }
    }
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out.push_str(&format!("{r}Next instructions\n", r = cursor::Goto(30, 3)));
        for (j, line) in self.lines.iter().enumerate() {
            let marker = if self.breakpoints.contains(&line.0) {
                format!("{}*{}", color::Fg(color::Red), color::Fg(color::Reset))
            } else if j == self.cursor {
                format!("{}>{}", color::Fg(color::Green), color::Fg(color::Reset))
            } else {
                " ".to_string()
            };
            out.push_str(&format!(
                "{r}{marker}{addr:016x}  {word:08x}  {text}\n",
                r = cursor::Goto(30, (j + 5) as u16),
                marker = marker,
                addr = line.0,
                word = line.1,
                text = line.2,
            ));
        }
        write!(f, "{}", out)
    }
}

#[derive(PartialEq, Clone)]
enum DebugCommand {
    Quit,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Continue,
    Step,
    Jump(Option<String>),
    Watch(Option<String>),
    Unwatch(Option<String>),
}

fn parse_address(arg: &Option<String>) -> Option<u64> {
    let text = arg.as_ref()?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

pub struct Debugger {
    disassembly: Disassembly,
    code_running: bool,
    last_cmd_is_continue: bool,
    watches: HashSet<u64>,
}

impl Debugger {
    pub fn new() -> Box<Self> {
        Box::new(Debugger { disassembly: Disassembly::new(12), code_running: false, last_cmd_is_continue: false, watches: HashSet::new() })
    }

    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return DebugCommand::Quit;
        }
        let mut words = input.split_whitespace();
        match words.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("b") => DebugCommand::SetBreakpoint(words.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(words.next().map(String::from)),
            Some("j") => DebugCommand::Jump(words.next().map(String::from)),
            Some("w") => DebugCommand::Watch(words.next().map(String::from)),
            Some("u") => DebugCommand::Unwatch(words.next().map(String::from)),
            Some("c") => DebugCommand::Continue,
            _ => {
                if self.last_cmd_is_continue {
                    DebugCommand::Continue
                } else {
                    DebugCommand::Step
                }
            }
        }
    }

    fn draw_user_interface(&mut self, cpu: &Cpu, fabric: &HostFabric) {
        print!("{}{}", clear::All, cursor::Goto(1, 1));
        println!(
            "PC {pc:016x}   halted={halted}   mode={mode:?}   cycles={cycles}",
            pc = cpu.pc,
            halted = cpu.halted(),
            mode = cpu.iprs.current_mode,
            cycles = cpu.cycle_counter,
        );
        for r in 0..8 {
            println!("r{:<2} {:016x}    r{:<2} {:016x}", r, cpu.integer.read(r, false), r + 8, cpu.integer.read(r + 8, false));
        }
        print!("{}", self.disassembly);
        if !self.watches.is_empty() {
            println!("{r}watched addresses:", r = cursor::Goto(1, (6 + self.disassembly.length) as u16));
            for address in self.watches.iter() {
                println!("{:016x}: {:016x}", address, fabric.read(*address, Width::Quad));
            }
        }
        println!(
            "{r}n/s step, c continue, b/d <addr> set/delete breakpoint, w/u <addr> watch/unwatch, j <addr> jump, q quit",
            r = cursor::Goto(1, (8 + self.disassembly.length + self.watches.len()) as u16)
        );
        print!("> ");
        io::stdout().flush().ok();
    }

    pub fn update(&mut self, cpu: &mut Cpu, fabric: &HostFabric) -> Signal {
        if !self.code_running || self.disassembly.breakpoints.contains(&cpu.pc) {
            self.code_running = false;
            self.disassembly.update(cpu, fabric);
            self.draw_user_interface(cpu, fabric);
            let cmd = self.get_command();
            match cmd {
                DebugCommand::Quit => Signal::Quit,
                DebugCommand::SetBreakpoint(ref a) => {
                    if let Some(addr) = parse_address(a) {
                        self.disassembly.breakpoints.insert(addr);
                    }
                    Signal::NoOp
                }
                DebugCommand::DeleteBreakpoint(ref a) => {
                    if let Some(addr) = parse_address(a) {
                        self.disassembly.breakpoints.remove(&addr);
                    }
                    Signal::NoOp
                }
                DebugCommand::Watch(ref a) => {
                    if let Some(addr) = parse_address(a) {
                        self.watches.insert(addr);
                    }
                    Signal::NoOp
                }
                DebugCommand::Unwatch(ref a) => {
                    if let Some(addr) = parse_address(a) {
                        self.watches.remove(&addr);
                    }
                    Signal::NoOp
                }
                DebugCommand::Continue => {
                    self.code_running = true;
                    self.last_cmd_is_continue = true;
                    Signal::Ok
                }
                DebugCommand::Step => {
                    self.last_cmd_is_continue = false;
                    Signal::Ok
                }
                DebugCommand::Jump(ref a) => match parse_address(a) {
                    Some(addr) => {
                        cpu.pc = addr;
                        Signal::Ok
                    }
                    None => Signal::NoOp,
                },
            }
        } else {
            Signal::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_accepts_hex_with_or_without_prefix() {
        assert_eq!(parse_address(&Some("0x1000".into())), Some(0x1000));
        assert_eq!(parse_address(&Some("1000".into())), Some(0x1000));
        assert_eq!(parse_address(&None), None);
    }

    #[test]
    fn disassembly_rebuilds_when_pc_leaves_the_window() {
        let fabric = HostFabric::new(0x10000, 1);
        let cpu = Cpu::new(0, 0x8000_0000, true);
        let mut disassembly = Disassembly::new(4);
        disassembly.update(&cpu, &fabric);
        assert_eq!(disassembly.lines.len(), 4);
        assert_eq!(disassembly.cursor, 0);
    }
}
