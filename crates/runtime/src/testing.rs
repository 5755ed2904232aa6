//! Scripted backends and fixtures for exercising runtimes without model weights.

use crate::accel::AccelerationType;
use crate::graph_runtime::{GraphBackend, GraphSession};
use crate::native::{NativeBackend, NativeSession, SessionParams, StepOutput};
use crate::tokenizer::TokenId;
use halo_common::{Error, Result, Role};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a scripted session does once its fragments run out
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptEnd {
    EndOfGeneration,
    Error(String),
    Panic,
    /// Keep producing the filler fragment forever
    Endless(String),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub fragments: Vec<String>,
    pub ending: ScriptEnd,
    pub step_delay: Option<Duration>,
    pub load_delay: Option<Duration>,
    pub fail_load: bool,
    pub refuse_completion: bool,
    pub speed: f32,
}

impl Script {
    pub fn replying(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn ending(mut self, ending: ScriptEnd) -> Self {
        self.ending = ending;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fragments: vec!["Hello".into(), ",".into(), " world".into(), "!".into()],
            ending: ScriptEnd::EndOfGeneration,
            step_delay: None,
            load_delay: None,
            fail_load: false,
            refuse_completion: false,
            speed: 12.5,
        }
    }
}

/// Everything the scripted engine observed
#[derive(Debug, Clone, Default)]
pub struct ScriptLog {
    pub loads: Vec<(PathBuf, SessionParams)>,
    pub frees: usize,
    pub prompts: Vec<String>,
    pub temperatures: Vec<f32>,
    /// Conversation buffer of the most recently used session
    pub conversation: Vec<(Role, String)>,
    pub clears: usize,
}

/// Native backend replaying a [`Script`]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            log: Arc::new(Mutex::new(ScriptLog::default())),
        })
    }

    /// Script used by sessions loaded from now on
    pub fn set_script(&self, script: Script) {
        *lock(&self.script) = script;
    }

    pub fn log(&self) -> ScriptLog {
        lock(&self.log).clone()
    }
}

impl NativeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&self, path: &Path, params: &SessionParams) -> Option<Box<dyn NativeSession>> {
        let script = lock(&self.script).clone();
        if let Some(delay) = script.load_delay {
            std::thread::sleep(delay);
        }
        if script.fail_load {
            return None;
        }
        lock(&self.log).loads.push((path.to_path_buf(), *params));
        Some(Box::new(ScriptedSession {
            script,
            log: self.log.clone(),
            messages: Vec::new(),
            cursor: 0,
            reply: String::new(),
            reply_stored: false,
        }))
    }
}

struct ScriptedSession {
    script: Script,
    log: Arc<Mutex<ScriptLog>>,
    messages: Vec<(Role, String)>,
    cursor: usize,
    reply: String,
    reply_stored: bool,
}

impl ScriptedSession {
    fn publish(&self) {
        lock(&self.log).conversation = self.messages.clone();
    }

    fn store_reply(&mut self) {
        if !self.reply_stored && !self.reply.is_empty() {
            self.messages
                .push((Role::Assistant, std::mem::take(&mut self.reply)));
            self.publish();
        }
        self.reply_stored = true;
    }
}

impl NativeSession for ScriptedSession {
    fn append_message(&mut self, role: Role, content: &str) {
        self.messages.push((role, content.to_string()));
        self.publish();
    }

    fn clear_conversation(&mut self) {
        self.messages.clear();
        lock(&self.log).clears += 1;
        self.publish();
    }

    fn begin_completion(&mut self, prompt: &str, temperature: f32) -> bool {
        if self.script.refuse_completion {
            return false;
        }
        {
            let mut log = lock(&self.log);
            log.prompts.push(prompt.to_string());
            log.temperatures.push(temperature);
        }
        self.messages.push((Role::User, prompt.to_string()));
        self.publish();
        self.cursor = 0;
        self.reply.clear();
        self.reply_stored = false;
        true
    }

    fn step(&mut self) -> StepOutput {
        if let Some(delay) = self.script.step_delay {
            std::thread::sleep(delay);
        }

        if let Some(fragment) = self.script.fragments.get(self.cursor).cloned() {
            self.cursor += 1;
            self.reply.push_str(&fragment);
            return StepOutput::Fragment(fragment);
        }

        match self.script.ending.clone() {
            ScriptEnd::EndOfGeneration => {
                self.store_reply();
                StepOutput::EndOfGeneration
            }
            ScriptEnd::Error(message) => StepOutput::Error(message),
            ScriptEnd::Panic => panic!("scripted engine failure"),
            ScriptEnd::Endless(filler) => {
                self.reply.push_str(&filler);
                StepOutput::Fragment(filler)
            }
        }
    }

    fn end_completion(&mut self) {
        self.store_reply();
    }

    fn generation_speed(&self) -> f32 {
        self.script.speed
    }

    fn context_tokens_used(&self) -> usize {
        self.messages
            .iter()
            .map(|(_, content)| content.len().div_ceil(4))
            .sum()
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        lock(&self.log).frees += 1;
    }
}

/// Tensor-graph backend whose logits pick a scripted id sequence
pub struct ScriptedGraphBackend {
    ids: Vec<TokenId>,
    vocab_size: usize,
    chat_template: Option<String>,
    fail_open: bool,
    forward_delay: Option<Duration>,
    opened: Arc<Mutex<Vec<AccelerationType>>>,
    input_lengths: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedGraphBackend {
    /// Emit `ids` in order, repeating the last one when they run out
    pub fn new(ids: &[TokenId], vocab_size: usize) -> Self {
        Self {
            ids: ids.to_vec(),
            vocab_size,
            chat_template: None,
            fail_open: false,
            forward_delay: None,
            opened: Arc::new(Mutex::new(Vec::new())),
            input_lengths: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_chat_template(mut self, template: &str) -> Self {
        self.chat_template = Some(template.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.forward_delay = Some(delay);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Accelerators requested by each `open`
    pub fn opened(&self) -> Vec<AccelerationType> {
        lock(&self.opened).clone()
    }

    /// Input length of every forward pass
    pub fn input_lengths(&self) -> Vec<usize> {
        lock(&self.input_lengths).clone()
    }
}

impl GraphBackend for ScriptedGraphBackend {
    fn open(&self, path: &Path, acceleration: AccelerationType) -> Result<Box<dyn GraphSession>> {
        if self.fail_open {
            return Err(Error::ModelLoad(format!("cannot open {}", path.display())));
        }
        lock(&self.opened).push(acceleration);
        Ok(Box::new(ScriptedGraphSession {
            ids: self.ids.clone(),
            vocab_size: self.vocab_size,
            chat_template: self.chat_template.clone(),
            delay: self.forward_delay,
            calls: 0,
            input_lengths: self.input_lengths.clone(),
        }))
    }
}

struct ScriptedGraphSession {
    ids: Vec<TokenId>,
    vocab_size: usize,
    chat_template: Option<String>,
    delay: Option<Duration>,
    calls: usize,
    input_lengths: Arc<Mutex<Vec<usize>>>,
}

impl GraphSession for ScriptedGraphSession {
    fn forward(&mut self, input_ids: &[TokenId]) -> Result<Vec<f32>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        lock(&self.input_lengths).push(input_ids.len());

        let next = self
            .ids
            .get(self.calls)
            .or_else(|| self.ids.last())
            .copied()
            .ok_or_else(|| Error::Generation("empty script".into()))?;
        self.calls += 1;

        let mut logits = vec![0.0; self.vocab_size];
        if let Some(slot) = logits.get_mut(next as usize) {
            *slot = 1.0;
        }
        Ok(logits)
    }

    fn chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }
}

/// Writes minimal GGUF headers
pub struct GgufHeader {
    entries: Vec<u8>,
    count: u64,
}

impl GgufHeader {
    const STRING: u32 = 8;
    const U32: u32 = 4;
    const F32: u32 = 6;
    const ARRAY: u32 = 9;

    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    fn key(&mut self, key: &str, value_type: u32) {
        self.push_str(key);
        self.entries.extend_from_slice(&value_type.to_le_bytes());
        self.count += 1;
    }

    fn push_str(&mut self, value: &str) {
        self.entries
            .extend_from_slice(&(value.len() as u64).to_le_bytes());
        self.entries.extend_from_slice(value.as_bytes());
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.key(key, Self::STRING);
        self.push_str(value);
        self
    }

    pub fn u32(mut self, key: &str, value: u32) -> Self {
        self.key(key, Self::U32);
        self.entries.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(mut self, key: &str, value: f32) -> Self {
        self.key(key, Self::F32);
        self.entries.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn string_array(mut self, key: &str, values: &[&str]) -> Self {
        self.key(key, Self::ARRAY);
        self.entries.extend_from_slice(&Self::STRING.to_le_bytes());
        self.entries
            .extend_from_slice(&(values.len() as u64).to_le_bytes());
        for value in values {
            self.push_str(value);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.entries.len());
        out.extend_from_slice(b"GGUF");
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.entries);
        out
    }

    pub fn write_to(self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}

impl Default for GgufHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a small GGUF artifact declaring `architecture` and `context_length`
pub fn write_gguf(dir: &Path, name: &str, architecture: &str, context_length: u32) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    GgufHeader::new()
        .string("general.architecture", architecture)
        .u32(&format!("{}.context_length", architecture), context_length)
        .write_to(&path)?;
    Ok(path)
}

/// Write a tensor-graph artifact and its sibling `vocab.json`
pub fn write_graph_model(dir: &Path, name: &str, vocab: &[(&str, TokenId)]) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, b"graph")?;
    let map: std::collections::HashMap<&str, TokenId> = vocab.iter().copied().collect();
    let json = serde_json::to_string(&map).map_err(std::io::Error::other)?;
    std::fs::write(dir.join("vocab.json"), json)?;
    Ok(path)
}
