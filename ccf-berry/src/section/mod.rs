//! 2D 组织学切片图像与切片平面指派.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use image::RgbImage;
use serde::Deserialize;

use crate::consts::ATLAS_RESOLUTION_UM;
use crate::Idx2d;

/// 切片元信息加载错误.
#[derive(Debug)]
pub enum OpenMetaError {
    /// JSON 解析错误.
    Json(serde_json::Error),

    /// 底层 I/O 错误.
    Io(io::Error),
}

impl fmt::Display for OpenMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "切片元信息解析失败: {e}"),
            Self::Io(e) => write!(f, "切片元信息读取失败: {e}"),
        }
    }
}

impl std::error::Error for OpenMetaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for OpenMetaError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for OpenMetaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// 单张切片的元信息, 来自图像提供方的 JSON.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SectionMeta {
    /// 全分辨率下单像素的物理尺寸, 单位为微米.
    pub resolution: f64,

    /// 图像下载时的 downsample 级别. 实际像素尺寸为 `resolution * 2^downsample`.
    pub downsample: u32,

    /// 强度均衡范围 \[下界, 上界\]. 均衡发生在提供方下载侧, 这里仅透传.
    pub intensity_range: [u16; 2],
}

impl SectionMeta {
    /// 从 JSON 文件加载元信息.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OpenMetaError> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// 一张 RGB 切片图像及其元信息.
#[derive(Debug, Clone)]
pub struct SectionImage {
    /// 像素数据.
    pub rgb: RgbImage,

    /// 元信息.
    pub meta: SectionMeta,
}

impl SectionImage {
    /// 打开切片图像文件. 任意 `image` crate 支持的格式均可, 内部统一为 RGB8.
    pub fn open<P: AsRef<Path>>(path: P, meta: SectionMeta) -> image::ImageResult<Self> {
        let rgb = image::open(path.as_ref())?.to_rgb8();
        Ok(Self { rgb, meta })
    }

    /// 图像的分辨率 (高, 宽).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        (self.rgb.height() as usize, self.rgb.width() as usize)
    }
}

/// 由切片元信息导出的投影几何.
#[derive(Debug, Clone, Copy)]
pub struct ImageGeom {
    um_per_px: f64,
    footprint_px: u32,
}

impl ImageGeom {
    /// 由元信息计算投影几何.
    ///
    /// `um_per_px` 为当前 downsample 级别下单像素的物理尺寸;
    /// `footprint_px` 为单个 annotation 体素投影后的方形边长
    /// (由体素尺寸导出, 至少 1 像素).
    pub fn new(meta: &SectionMeta) -> Self {
        let um_per_px = meta.resolution * f64::from(1u32 << meta.downsample);
        let footprint_px = (ATLAS_RESOLUTION_UM / um_per_px).round().max(1.0) as u32;
        Self {
            um_per_px,
            footprint_px,
        }
    }

    /// 当前 downsample 级别下单像素的物理尺寸, 单位为微米.
    #[inline]
    pub fn um_per_px(&self) -> f64 {
        self.um_per_px
    }

    /// 单个 annotation 体素投影后的方形 footprint 边长, 单位为像素.
    #[inline]
    pub fn footprint_px(&self) -> u32 {
        self.footprint_px
    }

    /// 物理点的 (x, y) 分量 -> 图像像素坐标 (列, 行). 向下取整, 可能越界.
    #[inline]
    pub fn project(&self, x_um: f64, y_um: f64) -> (i64, i64) {
        (
            (x_um / self.um_per_px).floor() as i64,
            (y_um / self.um_per_px).floor() as i64,
        )
    }
}

/// 最近切片指派: `round(z / spacing)`.
///
/// # 舍入规则
///
/// 采用 `f64::round`, 即 round-half-away-from-zero; 对该 pipeline
/// 实际出现的非负深度坐标等价于 round-half-up. 例如间距 100 下
/// `6250.0` 指派到切片 63, 而非 62.
#[inline]
pub fn section_of(z_um: f64, spacing_um: f64) -> i64 {
    (z_um / spacing_um).round() as i64
}

/// 变换后的点是否落在第 `index` 张切片上?
#[inline]
pub fn on_section(z_um: f64, spacing_um: f64, index: i64) -> bool {
    section_of(z_um, spacing_um) == index
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACING: f64 = 100.0;

    #[test]
    fn test_nearest_section_assignment() {
        // 目标切片 62 的平面中心为 6200.
        assert_eq!(section_of(6185.3, SPACING), 62);
        assert_eq!(section_of(6201.8, SPACING), 62);
        // 半程值: half-up, 向 63 舍入.
        assert_eq!(section_of(6250.0, SPACING), 63);
        // 另一侧边界: 6150 是 61/62 的半程, 同样向大处舍入.
        assert_eq!(section_of(6150.0, SPACING), 62);
        assert_eq!(section_of(6149.9, SPACING), 61);

        assert!(on_section(6201.8, SPACING, 62));
        assert!(!on_section(6250.0, SPACING, 62));
    }

    #[test]
    fn test_geom_projection() {
        let meta = SectionMeta {
            resolution: 0.78125,
            downsample: 5,
            intensity_range: [0, 4095],
        };
        let geom = ImageGeom::new(&meta);
        // 0.78125 * 32 = 25 微米每像素, footprint 恰为 1.
        assert!((geom.um_per_px() - 25.0).abs() < 1e-12);
        assert_eq!(geom.footprint_px(), 1);
        assert_eq!(geom.project(100.0, 49.9), (4, 1));
    }

    #[test]
    fn test_geom_footprint_scales_up() {
        let meta = SectionMeta {
            resolution: 0.78125,
            downsample: 3,
            intensity_range: [0, 4095],
        };
        let geom = ImageGeom::new(&meta);
        // 6.25 微米每像素: 一个 25 微米体素覆盖 4x4 像素.
        assert_eq!(geom.footprint_px(), 4);
    }
}
