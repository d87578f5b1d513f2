//! 电荷计算后端
//!
//! 计算库本身是外部协作者，这里只定义接口 `ChargeCalculator`，
//! 并提供一个通过外部 JSON 辅助程序调用计算库的实现 `CommandCalculator`。
//!
//! 辅助程序约定（所有输出都是 stdout 上的 JSON，失败时非零退出并在 stderr 说明原因）：
//!
//! ```text
//! <program> methods                                  -> ["eem", "veem", ...]
//! <program> parameters <method>                      -> ["EEM_00_NEEMP_ccd2016_npa.json", ...]
//! <program> suitable <file> [flags]                  -> [["eem", ["EEM_00_..json"]], ["veem", []]]
//! <program> charges <file> <method> [<parameters>] [flags]
//!                                                    -> [{"molecule": "1NER", "charges": [0.1, ...]}]
//! <program> info <file> [flags]                      -> {"molecules": 1, "atoms": 3, "atom_counts": {"C": 1, "O": 2}}
//! flags: --read-hetatm  --ignore-water
//! ```

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::{CalculationOptions, MoleculeCharges, StructureInfo};

/// 计算库返回的原始适用方法列表：方法名及其参数文件名
pub type MethodCandidates = Vec<(String, Vec<String>)>;

/// 电荷计算接口
///
/// 实现可以是阻塞的；调用方负责把调用放到阻塞线程池
pub trait ChargeCalculator: Send + Sync {
    fn available_methods(&self) -> Result<Vec<String>>;

    /// 方法的参数文件列表，方法不存在时返回 `MethodUnavailable`
    fn available_parameters(&self, method: &str) -> Result<Vec<String>>;

    /// 按优先级排列的适用方法，第一个是默认方法
    fn suitable_methods(
        &self,
        structure: &Path,
        options: CalculationOptions,
    ) -> Result<MethodCandidates>;

    fn calculate(
        &self,
        structure: &Path,
        method: &str,
        parameters: Option<&str>,
        options: CalculationOptions,
    ) -> Result<Vec<MoleculeCharges>>;

    /// 分子数、原子数和各元素的原子数
    fn structure_info(&self, structure: &Path, options: CalculationOptions)
        -> Result<StructureInfo>;
}

/// 通过外部辅助程序调用计算库
///
/// 方法列表在进程生命周期内不变，第一次成功查询后缓存
#[derive(Debug)]
pub struct CommandCalculator {
    program: PathBuf,
    methods: Mutex<Option<Vec<String>>>,
}

impl CommandCalculator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            methods: Mutex::new(None),
        }
    }

    fn run<T: DeserializeOwned>(&self, args: Vec<OsString>) -> Result<T> {
        debug!(program = %self.program.display(), ?args, "Invoking charge calculator");
        let output = Command::new(&self.program).args(&args).output().map_err(|e| {
            AppError::ComputationFailed(format!(
                "cannot run {}: {}",
                self.program.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(AppError::ComputationFailed(if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), output.status)
            } else {
                stderr
            }));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            AppError::ComputationFailed(format!("malformed calculator output: {}", e))
        })
    }
}

fn push_flags(args: &mut Vec<OsString>, options: CalculationOptions) {
    if options.read_hetatm {
        args.push("--read-hetatm".into());
    }
    if options.ignore_water {
        args.push("--ignore-water".into());
    }
}

impl ChargeCalculator for CommandCalculator {
    fn available_methods(&self) -> Result<Vec<String>> {
        if let Some(methods) = self.methods.lock().as_ref() {
            return Ok(methods.clone());
        }
        let methods: Vec<String> = self.run(vec!["methods".into()])?;
        *self.methods.lock() = Some(methods.clone());
        Ok(methods)
    }

    fn available_parameters(&self, method: &str) -> Result<Vec<String>> {
        if !self.available_methods()?.iter().any(|m| m == method) {
            return Err(AppError::MethodUnavailable(method.to_string()));
        }
        self.run(vec!["parameters".into(), method.into()])
    }

    fn suitable_methods(
        &self,
        structure: &Path,
        options: CalculationOptions,
    ) -> Result<MethodCandidates> {
        let mut args = vec!["suitable".into(), structure.as_os_str().to_owned()];
        push_flags(&mut args, options);
        self.run(args)
    }

    fn calculate(
        &self,
        structure: &Path,
        method: &str,
        parameters: Option<&str>,
        options: CalculationOptions,
    ) -> Result<Vec<MoleculeCharges>> {
        let mut args = vec![
            "charges".into(),
            structure.as_os_str().to_owned(),
            method.into(),
        ];
        if let Some(parameters) = parameters {
            args.push(parameters.into());
        }
        push_flags(&mut args, options);
        self.run(args)
    }

    fn structure_info(
        &self,
        structure: &Path,
        options: CalculationOptions,
    ) -> Result<StructureInfo> {
        let mut args = vec!["info".into(), structure.as_os_str().to_owned()];
        push_flags(&mut args, options);
        self.run(args)
    }
}
