//! 参考空间到标本空间的坐标映射.
//!
//! 完整映射是两步的纯函数组合: 先对物理点叠加稠密位移场在该点的采样值,
//! 再施加全局仿射变换. 两个产物都来自逐标本的配准输出.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use ndarray::Array4;

use crate::{Idx3d, PhysPoint};

pub mod meta;

pub use meta::MetaHeader;

/// 位移场加载错误.
#[derive(Debug)]
pub enum LoadFieldError {
    /// header 文本不合法或缺少必要字段.
    BadHeader(String),

    /// 元素类型不受支持 (目前仅支持 `MET_FLOAT` 三通道).
    UnsupportedElement(String),

    /// 裸数据文件的字节数与 header 宣称的形状不一致.
    SizeMismatch {
        /// 期望字节数.
        expected: usize,

        /// 实际字节数.
        actual: usize,
    },

    /// 底层 I/O 错误.
    Io(io::Error),
}

impl fmt::Display for LoadFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHeader(s) => write!(f, "位移场 header 非法: {s}"),
            Self::UnsupportedElement(t) => write!(f, "不支持的位移场元素类型 `{t}`"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "位移场数据大小不一致: 期望 {expected} 字节, 实际 {actual} 字节")
            }
            Self::Io(e) => write!(f, "位移场读取失败: {e}"),
        }
    }
}

impl std::error::Error for LoadFieldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LoadFieldError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// 仿射参数加载错误.
#[derive(Debug)]
pub enum LoadAffineError {
    /// 文件中含无法解析的数字.
    Parse(String),

    /// 参数个数不是 12.
    WrongCount(usize),

    /// 底层 I/O 错误.
    Io(io::Error),
}

impl fmt::Display for LoadAffineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(tok) => write!(f, "仿射参数含非法数字 `{tok}`"),
            Self::WrongCount(n) => write!(f, "仿射参数个数错误: 期望 12, 实际 {n}"),
            Self::Io(e) => write!(f, "仿射参数读取失败: {e}"),
        }
    }
}

impl std::error::Error for LoadAffineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LoadAffineError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// 稠密位移场.
///
/// 每个体素存一个三维位移向量, 内部按 `[z, H, W, 3]` 布局,
/// 通道顺序为 `[dx, dy, dz]`. 场本身定义在物理空间上.
#[derive(Debug, Clone)]
pub struct DisplacementField {
    data: Array4<f32>,
    spacing: [f64; 3],
    origin: [f64; 3],
}

impl DisplacementField {
    /// 打开 `.mhd` + 裸数据文件对. `mhd_path` 为 header 的本地路径,
    /// 裸数据文件按 header 的 `ElementDataFile` 字段在同目录下定位.
    pub fn open<P: AsRef<Path>>(mhd_path: P) -> Result<Self, LoadFieldError> {
        let mhd_path = mhd_path.as_ref();
        let header = MetaHeader::parse(&fs::read_to_string(mhd_path)?)?;

        if header.ndims != 3 || header.channels != 3 {
            return Err(LoadFieldError::BadHeader(format!(
                "位移场要求 NDims = 3 且三通道, 实际 NDims = {}, 通道 = {}",
                header.ndims, header.channels
            )));
        }
        if header.element_type != "MET_FLOAT" {
            return Err(LoadFieldError::UnsupportedElement(header.element_type));
        }

        let raw_path = mhd_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&header.data_file);
        let bytes = fs::read(&raw_path)?;

        // header 按 [x, y, z] 宣称形状; 裸数据中通道最快, 其次 x, y, z.
        let [nx, ny, nz] = [header.dim_size[0], header.dim_size[1], header.dim_size[2]];
        let expected = nx * ny * nz * 3 * 4;
        if bytes.len() != expected {
            return Err(LoadFieldError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        // [z, H, W, 3] 行优先布局下, 最后一维最快, 与裸数据顺序一致.
        let data = Array4::from_shape_vec((nz, ny, nx, 3), floats).unwrap();

        Ok(Self {
            data,
            spacing: [header.spacing[0], header.spacing[1], header.spacing[2]],
            origin: [header.offset[0], header.offset[1], header.offset[2]],
        })
    }

    /// 构建零位移场. `shape` 按 (z, H, W) 给出, `spacing` 按 \[x, y, z\] 给出.
    ///
    /// 各维必须非零, 否则 panic. 你应仅将其用于实验目的.
    pub fn identity(shape: Idx3d, spacing: [f64; 3]) -> Self {
        let (z, h, w) = shape;
        assert!(z > 0 && h > 0 && w > 0);
        Self {
            data: Array4::zeros((z, h, w, 3)),
            spacing,
            origin: [0.0; 3],
        }
    }

    /// 场的形状, 按 (z, H, W).
    #[inline]
    pub fn shape(&self) -> Idx3d {
        let (z, h, w, _) = self.data.dim();
        (z, h, w)
    }

    /// 在物理点 `p` 处 trilinear 采样位移向量.
    ///
    /// # 边界策略
    ///
    /// 采样位置超出场范围时, 连续场索引被 **clamp 到场边界**
    /// (即按最近的边界体素外推). 该策略是显式约定, 不会返回 `Err`.
    pub fn sample(&self, p: PhysPoint) -> PhysPoint {
        let (nz, ny, nx, _) = self.data.dim();

        let cx = ((p[0] - self.origin[0]) / self.spacing[0]).clamp(0.0, (nx - 1) as f64);
        let cy = ((p[1] - self.origin[1]) / self.spacing[1]).clamp(0.0, (ny - 1) as f64);
        let cz = ((p[2] - self.origin[2]) / self.spacing[2]).clamp(0.0, (nz - 1) as f64);

        let (x0, y0, z0) = (cx.floor() as usize, cy.floor() as usize, cz.floor() as usize);
        let (x1, y1, z1) = ((x0 + 1).min(nx - 1), (y0 + 1).min(ny - 1), (z0 + 1).min(nz - 1));
        let (fx, fy, fz) = (cx - x0 as f64, cy - y0 as f64, cz - z0 as f64);

        let mut out = [0.0f64; 3];
        for (c, slot) in out.iter_mut().enumerate() {
            let v = |z: usize, y: usize, x: usize| f64::from(self.data[[z, y, x, c]]);

            let c00 = v(z0, y0, x0) * (1.0 - fx) + v(z0, y0, x1) * fx;
            let c10 = v(z0, y1, x0) * (1.0 - fx) + v(z0, y1, x1) * fx;
            let c01 = v(z1, y0, x0) * (1.0 - fx) + v(z1, y0, x1) * fx;
            let c11 = v(z1, y1, x0) * (1.0 - fx) + v(z1, y1, x1) * fx;

            let c0 = c00 * (1.0 - fy) + c10 * fy;
            let c1 = c01 * (1.0 - fy) + c11 * fy;
            *slot = c0 * (1.0 - fz) + c1 * fz;
        }
        out
    }
}

/// 全局仿射变换: `y = A x + t`. 方向约定为参考空间 -> 标本空间.
#[derive(Debug, Clone, Copy)]
pub struct Affine3 {
    matrix: [[f64; 3]; 3],
    offset: [f64; 3],
}

impl Affine3 {
    /// 恒等变换.
    #[inline]
    pub const fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            offset: [0.0; 3],
        }
    }

    /// 由 12 参数扁平向量构建: 前 9 个为行优先 3x3 矩阵, 后 3 个为平移.
    pub fn from_params(p: &[f64; 12]) -> Self {
        Self {
            matrix: [
                [p[0], p[1], p[2]],
                [p[3], p[4], p[5]],
                [p[6], p[7], p[8]],
            ],
            offset: [p[9], p[10], p[11]],
        }
    }

    /// 从文本文件读取 12 参数. 数字以空白分隔, `#` 开头的行被忽略.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadAffineError> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut params = [0.0f64; 12];
        let mut n = 0usize;
        for tok in text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(str::split_whitespace)
        {
            let v = tok
                .parse::<f64>()
                .map_err(|_| LoadAffineError::Parse(tok.to_owned()))?;
            if n < 12 {
                params[n] = v;
            }
            n += 1;
        }
        if n != 12 {
            return Err(LoadAffineError::WrongCount(n));
        }
        Ok(Self::from_params(&params))
    }

    /// 施加仿射变换: `A p + t`.
    pub fn apply(&self, p: PhysPoint) -> PhysPoint {
        let m = &self.matrix;
        [
            m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + self.offset[0],
            m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + self.offset[1],
            m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + self.offset[2],
        ]
    }
}

/// 参考空间物理点 -> 标本空间物理点: 先位移场, 后仿射.
#[inline]
pub fn transform_point(field: &DisplacementField, affine: &Affine3, p: PhysPoint) -> PhysPoint {
    let d = field.sample(p);
    affine.apply([p[0] + d[0], p[1] + d[1], p[2] + d[2]])
}

/// 参考体数据体素索引 -> 标本空间物理点.
///
/// 体素索引先按 `resolution_um` 缩放到物理微米
/// (`(z, h, w)` 对应物理 `[x, y, z] = [w, h, z] * res`), 再做两步变换.
#[inline]
pub fn transform_voxel(
    field: &DisplacementField,
    affine: &Affine3,
    (z, h, w): Idx3d,
    resolution_um: f64,
) -> PhysPoint {
    let p = [
        w as f64 * resolution_um,
        h as f64 * resolution_um,
        z as f64 * resolution_um,
    ];
    transform_point(field, affine, p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_identity_field_plus_identity_affine() {
        let field = DisplacementField::identity((4, 4, 4), [25.0, 25.0, 25.0]);
        let affine = Affine3::identity();
        let q = transform_point(&field, &affine, [30.0, 55.0, 70.0]);
        assert!(float_eq(q[0], 30.0));
        assert!(float_eq(q[1], 55.0));
        assert!(float_eq(q[2], 70.0));
    }

    #[test]
    fn test_voxel_scaling() {
        let field = DisplacementField::identity((4, 4, 4), [25.0, 25.0, 25.0]);
        let affine = Affine3::identity();
        // (z, h, w) = (2, 1, 3) -> [x, y, z] = [75, 25, 50].
        let q = transform_voxel(&field, &affine, (2, 1, 3), 25.0);
        assert!(float_eq(q[0], 75.0));
        assert!(float_eq(q[1], 25.0));
        assert!(float_eq(q[2], 50.0));
    }

    #[test]
    fn test_affine_params() {
        // 均匀缩放 2 倍 + 平移 [1, 2, 3].
        let a = Affine3::from_params(&[
            2.0, 0.0, 0.0, //
            0.0, 2.0, 0.0, //
            0.0, 0.0, 2.0, //
            1.0, 2.0, 3.0,
        ]);
        let q = a.apply([10.0, 20.0, 30.0]);
        assert!(float_eq(q[0], 21.0));
        assert!(float_eq(q[1], 42.0));
        assert!(float_eq(q[2], 63.0));
    }

    #[test]
    fn test_trilinear_midpoint() {
        // 2x2x2 场, 仅 (z, y, x) = (0, 0, 0) 处 dx = 8, 其余为 0.
        // 在体素间距 1 下, 物理点 (0.5, 0, 0) 处应插值出 dx = 4.
        let mut f = DisplacementField::identity((2, 2, 2), [1.0, 1.0, 1.0]);
        f.data[[0, 0, 0, 0]] = 8.0;
        let d = f.sample([0.5, 0.0, 0.0]);
        assert!(float_eq(d[0], 4.0));
        assert!(float_eq(d[1], 0.0));

        // 立方体中心: 8 个角只有一个非零, 权重 1/8.
        let d = f.sample([0.5, 0.5, 0.5]);
        assert!(float_eq(d[0], 1.0));
    }

    #[test]
    fn test_sample_out_of_bounds_is_clamped() {
        let mut f = DisplacementField::identity((2, 2, 2), [1.0, 1.0, 1.0]);
        f.data[[1, 1, 1, 2]] = 5.0;
        // 远超场范围的点被 clamp 到 (1, 1, 1) 角.
        let d = f.sample([100.0, 100.0, 100.0]);
        assert!(float_eq(d[2], 5.0));
        // 负方向同理, clamp 到 (0, 0, 0) 角.
        let d = f.sample([-100.0, -100.0, -100.0]);
        assert!(float_eq(d[2], 0.0));
    }
}
