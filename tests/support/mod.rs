#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bootmend::core::{Firmware, ResolvedCommand, TargetVolume, win_join};
use bootmend::engine::{Capabilities, Engine, EngineSettings};
use bootmend::logs::MemoryLog;
use bootmend::platform::memory::{MemoryFiles, ScriptedPrompt, StaticEnvironment};
use bootmend::platform::{
    CommandOutput, CommandRunError, CommandRunner, FileProbe, FileProbeError,
};

pub const VOLUME: &str = "\\\\?\\Volume{5eb0c5e1-7a1f-4c3e-9d2b-100000000000}";
pub const BACKUP_DIR: &str = "B:\\bootmend";

const READ_ONLY_TOOLS: [&str; 3] = ["powershell", "bcdedit", "manage-bde"];

const STORE_ENUM: &str = "\
Windows Boot Manager
--------------------
identifier              {bootmgr}
device                  partition=S:
path                    \\EFI\\Microsoft\\Boot\\bootmgfw.efi
default                 {current}

Windows Boot Loader
-------------------
identifier              {current}
device                  partition=C:
path                    \\Windows\\system32\\winload.efi
description             Windows 10
";

/// A loadable image: `MZ` header padded to the minimum loader size.
pub fn image() -> Vec<u8> {
    let mut bytes = b"MZ".to_vec();
    bytes.resize(64 * 1024, 0);
    bytes
}

pub fn store_hive() -> Vec<u8> {
    let mut bytes = b"regf".to_vec();
    bytes.resize(16 * 1024, 0);
    bytes
}

#[derive(Debug)]
struct Disk {
    present: bool,
    letter: Option<String>,
    file_system: String,
    write_protect: bool,
    dism_restores: bool,
    missing_tools: Vec<String>,
    fail_once: Vec<(String, i32)>,
}

type CommandHook = Arc<dyn Fn(&ResolvedCommand) + Send + Sync>;

/// One disk with a Windows volume on C: and an ESP, driven by the commands
/// the engine issues. Paths under the ESP's drive letter and under its volume
/// path name the same files.
#[derive(Clone)]
pub struct SimMachine {
    files: MemoryFiles,
    disk: Arc<Mutex<Disk>>,
    calls: Arc<Mutex<Vec<ResolvedCommand>>>,
    hook: Arc<Mutex<Option<CommandHook>>>,
}

impl SimMachine {
    pub fn healthy() -> Self {
        let sim = Self {
            files: MemoryFiles::new(),
            disk: Arc::new(Mutex::new(Disk {
                present: true,
                letter: Some("S:".to_string()),
                file_system: "FAT32".to_string(),
                write_protect: false,
                dism_restores: true,
                missing_tools: Vec::new(),
                fail_once: Vec::new(),
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
            hook: Arc::new(Mutex::new(None)),
        };
        sim.files.put("C:\\Windows\\System32\\winload.efi", image());
        sim.files.put("C:\\Windows\\Boot\\EFI\\bootmgfw.efi", image());
        sim.files.put("C:\\Windows\\System32\\drivers\\stornvme.sys", b"MZ-nvme".to_vec());
        sim.files.put("C:\\Windows\\System32\\drivers\\storahci.sys", b"MZ-ahci".to_vec());
        sim.put_esp("EFI\\Microsoft\\Boot\\bootmgfw.efi", image());
        sim.put_esp("EFI\\Microsoft\\Boot\\BCD", store_hive());
        sim
    }

    fn disk(&self) -> std::sync::MutexGuard<'_, Disk> {
        self.disk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn unmounted(self) -> Self {
        self.disk().letter = None;
        self
    }

    pub fn without_partition(self) -> Self {
        self.disk().present = false;
        self
    }

    pub fn with_file_system(self, fs: &str) -> Self {
        self.disk().file_system = fs.to_string();
        self
    }

    /// Commands still exit 0 but nothing they write reaches the disk.
    pub fn write_protected(self) -> Self {
        self.disk().write_protect = true;
        self
    }

    /// `dism` exits 0 without restoring anything.
    pub fn without_dism_restore(self) -> Self {
        self.disk().dism_restores = false;
        self
    }

    pub fn without_tool(self, program: &str) -> Self {
        self.disk().missing_tools.push(program.to_string());
        self
    }

    /// The next run of `program` exits with `code` and does nothing.
    pub fn failing_once(self, program: &str, code: i32) -> Self {
        self.disk().fail_once.push((program.to_string(), code));
        self
    }

    /// Called before every command runs, outside any lock the simulator holds.
    pub fn on_command(&self, hook: impl Fn(&ResolvedCommand) + Send + Sync + 'static) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn without_esp_file(self, rel: &str) -> Self {
        self.files.remove(&win_join(VOLUME, rel));
        self
    }

    pub fn without_system_file(self, rel: &str) -> Self {
        self.files.remove(&win_join("C:", rel));
        self
    }

    pub fn with_esp_file(self, rel: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.put_esp(rel, bytes);
        self
    }

    pub fn put_esp(&self, rel: &str, bytes: impl Into<Vec<u8>>) {
        self.files.put(&win_join(VOLUME, rel), bytes);
    }

    pub fn esp_has(&self, rel: &str) -> bool {
        self.files.exists(&win_join(VOLUME, rel)).unwrap_or(false)
    }

    pub fn letter(&self) -> Option<String> {
        self.disk().letter.clone()
    }

    pub fn file_system(&self) -> String {
        self.disk().file_system.clone()
    }

    pub fn files(&self) -> &MemoryFiles {
        &self.files
    }

    pub fn calls(&self) -> Vec<ResolvedCommand> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !READ_ONLY_TOOLS.contains(&c.program.as_str()))
            .map(|c| c.cmdline())
            .collect()
    }

    pub fn ran(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c.program == program).count()
    }

    /// Maps `S:\...` onto the ESP's volume path while S: is assigned.
    fn resolve(&self, path: &str) -> String {
        let disk = self.disk();
        if let Some(letter) = &disk.letter {
            let lower = path.to_ascii_lowercase();
            let prefix = letter.to_ascii_lowercase();
            if let Some(rest) = lower.strip_prefix(&prefix) {
                if rest.is_empty() || rest.starts_with('\\') {
                    return format!("{VOLUME}{}", &path[letter.len()..]);
                }
            }
        }
        path.to_string()
    }

    fn writable(&self, resolved: &str) -> bool {
        if !self.disk().write_protect {
            return true;
        }
        let lower = resolved.to_ascii_lowercase();
        !(lower.starts_with(&VOLUME.to_ascii_lowercase()) || lower.starts_with("c:"))
    }

    fn write(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let resolved = self.resolve(path);
        if self.writable(&resolved) {
            self.files.put(&resolved, bytes);
        }
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        let resolved = self.resolve(path);
        let size = self.files.size(&resolved).ok()??;
        self.files
            .read_text(&resolved, size as usize)
            .ok()
            .map(String::into_bytes)
    }

    fn partition_query(&self) -> CommandOutput {
        let disk = self.disk();
        if !disk.present {
            return CommandOutput::ok("");
        }
        let (letter, paths) = match &disk.letter {
            Some(l) => (l.trim_end_matches(':').to_string(), format!("{l}\\;{VOLUME}\\")),
            None => (String::new(), format!("{VOLUME}\\")),
        };
        CommandOutput::ok(format!("ESP|{letter}|{}|{paths}\r\n", disk.file_system))
    }

    fn mountvol(&self, args: &[String]) -> CommandOutput {
        let mut disk = self.disk();
        match args.first() {
            Some(letter) if disk.present => {
                disk.letter = Some(letter.to_ascii_uppercase());
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "The parameter is incorrect."),
        }
    }

    fn cmd(&self, args: &[String]) -> CommandOutput {
        let verb = args.get(1).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
        match (verb.as_str(), args.get(3), args.get(4)) {
            ("copy", Some(from), Some(to)) => match self.read(from) {
                Some(bytes) => {
                    self.write(to, bytes);
                    CommandOutput::ok("        1 file(s) copied.")
                }
                None => CommandOutput::failed(1, "The system cannot find the file specified."),
            },
            ("move", Some(from), Some(to)) => {
                let (from, to) = (self.resolve(from), self.resolve(to));
                if self.writable(&from) && !self.files.rename(&from, &to) {
                    return CommandOutput::failed(1, "The system cannot find the file specified.");
                }
                CommandOutput::ok("        1 file(s) moved.")
            }
            ("del", _, Some(path)) => {
                let path = self.resolve(path);
                if self.writable(&path) {
                    self.files.remove(&path);
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "The syntax of the command is incorrect."),
        }
    }

    fn bcdboot(&self, args: &[String]) -> CommandOutput {
        let (Some(windows), Some(esp)) = (args.first(), args.get(2)) else {
            return CommandOutput::failed(1, "Invalid command line switch.");
        };
        if !self.disk().file_system.eq_ignore_ascii_case("FAT32") {
            return CommandOutput::failed(1, "Failure when attempting to copy boot files.");
        }
        let Some(manager) = self.read(&win_join(windows, "Boot\\EFI\\bootmgfw.efi")) else {
            return CommandOutput::failed(1, "BFSVC Error: Could not open the BCD template store.");
        };
        self.write(&win_join(esp, "EFI\\Microsoft\\Boot\\bootmgfw.efi"), manager);
        self.write(&win_join(esp, "EFI\\Microsoft\\Boot\\BCD"), store_hive());
        CommandOutput::ok("Boot files successfully created.")
    }

    fn bcdedit(&self, args: &[String]) -> CommandOutput {
        let Some(store) = args.get(1) else {
            return CommandOutput::failed(1, "The store parameter is missing.");
        };
        match self.read(store) {
            Some(bytes) if bytes.starts_with(b"regf") => CommandOutput::ok(STORE_ENUM),
            Some(_) => CommandOutput::failed(
                1,
                "The boot configuration data store could not be opened.\nThe system cannot find the file specified.",
            ),
            None => CommandOutput::failed(
                1,
                "The boot configuration data store could not be opened.",
            ),
        }
    }

    fn format(&self, args: &[String]) -> CommandOutput {
        let Some(esp) = args.first() else {
            return CommandOutput::failed(1, "Required parameter missing");
        };
        let root = self.resolve(esp);
        if self.writable(&root) {
            self.files.remove_tree(&root);
            self.disk().file_system = "FAT32".to_string();
        }
        CommandOutput::ok("Format complete.")
    }

    fn robocopy(&self, args: &[String]) -> CommandOutput {
        let (Some(from), Some(to)) = (args.first(), args.get(1)) else {
            return CommandOutput::failed(16, "ERROR : Invalid Parameter");
        };
        let from = self.resolve(from);
        let copied = match args.get(2).filter(|a| !a.starts_with('/')) {
            Some(name) => match self.read(&win_join(&from, name)) {
                Some(bytes) => {
                    self.files.put(&win_join(to, name), bytes);
                    1
                }
                None => 0,
            },
            None => self.files.copy_tree(&from, to),
        };
        CommandOutput {
            exit_code: i32::from(copied > 0),
            stdout: format!("Files : {copied}"),
            stderr: String::new(),
        }
    }

    fn dism(&self) -> CommandOutput {
        if self.disk().dism_restores {
            self.write("C:\\Windows\\System32\\winload.efi", image());
            self.write("C:\\Windows\\System32\\drivers\\stornvme.sys", b"MZ-nvme".to_vec());
            self.write("C:\\Windows\\System32\\drivers\\storahci.sys", b"MZ-ahci".to_vec());
        }
        CommandOutput::ok("The restore operation completed successfully.")
    }

    fn respond(&self, command: &ResolvedCommand) -> Result<CommandOutput, CommandRunError> {
        let args = &command.args;
        {
            let mut disk = self.disk();
            if disk.missing_tools.contains(&command.program) {
                return Err(CommandRunError::ToolUnavailable {
                    program: command.program.clone(),
                });
            }
            if let Some(pos) = disk.fail_once.iter().position(|(p, _)| *p == command.program) {
                let (_, code) = disk.fail_once.remove(pos);
                return Ok(CommandOutput::failed(code, "The operation failed."));
            }
        }
        let out = match command.program.as_str() {
            "powershell" => self.partition_query(),
            "manage-bde" => CommandOutput::ok(
                "Volume C: [OS]\n    Protection Status:    Protection Off\n    Lock Status:          Unlocked\n",
            ),
            "mountvol" => self.mountvol(args),
            "cmd" => self.cmd(args),
            "bcdboot" => self.bcdboot(args),
            "bcdedit" => self.bcdedit(args),
            "format" => self.format(args),
            "robocopy" => self.robocopy(args),
            "dism" => self.dism(),
            "sfc" => CommandOutput::ok("Windows Resource Protection did not find any integrity violations."),
            other => {
                return Err(CommandRunError::ToolUnavailable {
                    program: other.to_string(),
                });
            }
        };
        Ok(out)
    }
}

impl CommandRunner for SimMachine {
    fn execute(
        &self,
        command: &ResolvedCommand,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandRunError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(command);
        }
        self.respond(command)
    }
}

impl FileProbe for SimMachine {
    fn exists(&self, path: &str) -> Result<bool, FileProbeError> {
        self.files.exists(&self.resolve(path))
    }

    fn size(&self, path: &str) -> Result<Option<u64>, FileProbeError> {
        self.files.size(&self.resolve(path))
    }

    fn read_text(&self, path: &str, limit: usize) -> Result<String, FileProbeError> {
        self.files.read_text(&self.resolve(path), limit)
    }
}

pub fn temp_dir(tag: &str) -> PathBuf {
    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "bootmend-{tag}-{}-{seq}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub struct Harness {
    pub engine: Engine,
    pub sim: SimMachine,
    pub prompt: Arc<ScriptedPrompt>,
    pub log: Arc<MemoryLog>,
    pub lock_dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.lock_dir);
    }
}

pub fn recovery() -> StaticEnvironment {
    StaticEnvironment::recovery(Firmware::Uefi)
}

pub fn harness(sim: SimMachine, env: StaticEnvironment, prompt: ScriptedPrompt) -> Harness {
    harness_with(sim, env, prompt, EngineSettings::default())
}

pub fn harness_with(
    sim: SimMachine,
    env: StaticEnvironment,
    prompt: ScriptedPrompt,
    mut settings: EngineSettings,
) -> Harness {
    let lock_dir = temp_dir("locks");
    settings.lock_dir = Some(lock_dir.clone());
    settings.repair.backup_dir = BACKUP_DIR.to_string();
    let prompt = Arc::new(prompt);
    let log = Arc::new(MemoryLog::new());
    let caps = Capabilities {
        runner: Arc::new(sim.clone()),
        files: Arc::new(sim.clone()),
        env_info: Arc::new(env),
        prompt: prompt.clone(),
        logger: log.clone(),
    };
    Harness {
        engine: Engine::new(settings, caps),
        sim,
        prompt,
        log,
        lock_dir,
    }
}

pub fn drive(letter: &str) -> TargetVolume {
    TargetVolume::new(letter).expect("valid drive")
}

pub fn phrase() -> ScriptedPrompt {
    ScriptedPrompt::typing("WIPE BOOT PARTITION")
}
