#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供小鼠脑参考图谱 (CCF annotation) 与单张组织学切片图像之间的
//! 解剖区域映射与叠加绘制功能.
//!
//! 该 crate 目前仅提供 `safe` 接口. 整条 pipeline 是严格单线程的一趟前向计算,
//! 不存在跨调用共享的可变状态.
//!
//! # 注意
//!
//! 1. 该 crate 假设 annotation 体数据为 25 微米各向同性分辨率 (CCF 惯例),
//!   分辨率实际值从 nii header 读取并校验.
//! 2. 在非期望情况下, 程序会直接返回 `Err` 或 panic, 而不会导致内存错误.
//!   As what Rust promises.
//!
//! # 功能总览
//!
//! ### 结构本体 (ontology) 查询 ✅
//!
//! id / acronym / 颜色 / 祖先链查询, 以及按祖先深度排序的绘制顺序.
//!
//! 实现位于 `ccf-berry/src/ontology`.
//!
//! ### 参考空间到标本空间的坐标映射 ✅
//!
//! 稠密位移场 (trilinear 采样, 边界 clamp) + 仿射变换的纯函数组合.
//!
//! 实现位于 `ccf-berry/src/warp`.
//!
//! ### 切片平面指派 ✅
//!
//! 最近切片指派 (`round(z / spacing)`), 而非精确匹配过滤.
//!
//! 实现位于 `ccf-berry/src/section`.
//!
//! ### 逐结构栅格化 ✅
//!
//! 3D 结构 mask -> 目标切片 2D 区域. 方形 footprint 绘制 + 形态学闭运算 +
//! 空洞填充, 结果对相同输入逐 bit 一致.
//!
//! 实现位于 `ccf-berry/src/raster`.
//!
//! ### 叠加合成与持久化 ✅
//!
//! area / boundary / color_composite 三张输出图, 原子写出
//! (要么三张全部落盘, 要么一张都不写).
//!
//! 实现位于 `ccf-berry/src/overlay`.
//!
//! ### 线性 pipeline 驱动 ✅
//!
//! 结构发现 (含 ROI 强制并入), 逐结构顺序处理以控制内存峰值.
//!
//! 实现位于 `ccf-berry/src/pipeline`.

/// 二维索引 (高, 宽), 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引 (z, 高, 宽), 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 物理空间点, 按 `[x, y, z]` 排列, 单位为微米.
pub type PhysPoint = [f64; 3];

pub mod annot;

pub mod consts;

pub mod dataset;

pub mod ontology;

pub mod overlay;

pub mod pipeline;

pub mod prelude;

pub mod raster;

pub mod section;

pub mod warp;

pub use annot::{AnnotVolume, VolumeAttr};
pub use ontology::{Structure, StructureTree};
pub use raster::Mask2d;
pub use section::{SectionImage, SectionMeta};
pub use warp::{Affine3, DisplacementField};
