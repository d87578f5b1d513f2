//! 电荷计算请求与结果

use serde::{Deserialize, Serialize};
use std::path::Path;

/// 读取结构时的选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationOptions {
    /// 除蛋白质外是否读取配体 (HETATM)
    pub read_hetatm: bool,
    /// 是否忽略水分子
    pub ignore_water: bool,
}

impl Default for CalculationOptions {
    fn default() -> Self {
        Self {
            read_hetatm: true,
            ignore_water: false,
        }
    }
}

/// 计算请求
///
/// `method` 为空时使用第一个适用的方法及其第一组参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub method: Option<String>,
    pub parameters: Option<String>,
    #[serde(default)]
    pub options: CalculationOptions,
}

impl ChargeRequest {
    pub fn new(method: impl Into<String>, parameters: Option<String>) -> Self {
        Self {
            method: Some(method.into()),
            parameters,
            options: CalculationOptions::default(),
        }
    }
}

/// 单个分子的电荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoleculeCharges {
    pub molecule: String,
    pub charges: Vec<f64>,
}

/// 返回给客户端的计算结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargesPayload {
    pub charges: Vec<MoleculeCharges>,
    pub method: String,
    pub parameters: Option<String>,
    /// 计算耗时（秒，保留两位小数）
    pub calc_time: f64,
}

impl ChargesPayload {
    /// 按四位小数整理电荷
    pub fn rounded(
        charges: Vec<MoleculeCharges>,
        method: String,
        parameters: Option<String>,
        calc_time: f64,
    ) -> Self {
        let charges = charges
            .into_iter()
            .map(|molecule| MoleculeCharges {
                molecule: molecule.molecule,
                charges: molecule.charges.into_iter().map(|c| round_to(c, 4)).collect(),
            })
            .collect();

        Self {
            charges,
            method,
            parameters,
            calc_time: round_to(calc_time, 2),
        }
    }
}

/// 适用于某个结构的方法及其参数集
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuitableMethod {
    pub method: String,
    pub parameters: Option<Vec<String>>,
}

impl SuitableMethod {
    /// 参数文件名去掉后缀后对外展示
    pub fn from_parameter_files(method: String, parameter_files: Vec<String>) -> Self {
        let parameters = if parameter_files.is_empty() {
            None
        } else {
            Some(
                parameter_files
                    .iter()
                    .map(|file| {
                        Path::new(file)
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().into_owned())
                            .unwrap_or_else(|| file.clone())
                    })
                    .collect(),
            )
        };
        Self { method, parameters }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
