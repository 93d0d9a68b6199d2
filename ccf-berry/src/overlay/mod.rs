//! 叠加合成与持久化.
//!
//! 维护两张与切片图像等大的输出图: area 图按结构颜色填充区域
//! (后画的覆盖先画的, 绘制顺序由调用方按祖先深度保证), boundary 图
//! 仅为 ROI 描绘形态学轮廓. 最终另合成一张原图与 area 图的 alpha 混合图.
//!
//! 三张输出的落盘是原子的: 要么全部写出, 要么一张都不留.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{ImageFormat, Rgb, RgbImage};
use itertools::izip;

use crate::consts::{rgb, DEFAULT_BLEND_ALPHA, DEFAULT_BOUNDARY_ERODE_ITERS};
use crate::raster::Mask2d;
use crate::section::SectionImage;

/// 输出图像持久化错误.
#[derive(Debug)]
pub enum SaveError {
    /// 图像编码/写出错误.
    Image(image::ImageError),

    /// 底层 I/O 错误.
    Io(io::Error),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(e) => write!(f, "输出图像写出失败: {e}"),
            Self::Io(e) => write!(f, "输出图像落盘失败: {e}"),
        }
    }
}

impl std::error::Error for SaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for SaveError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<image::ImageError> for SaveError {
    fn from(e: image::ImageError) -> Self {
        Self::Image(e)
    }
}

/// 叠加绘制的样式参数.
///
/// 默认值保留自上游 pipeline 的常量 (腐蚀 6 次, 不透明度 80/255),
/// 其 "正确" 取值并无依据, 因此允许逐次运行覆盖.
#[derive(Debug, Clone, Copy)]
pub struct OverlayStyle {
    /// 轮廓宽度控制: boundary = mask 减去 mask 的该次数腐蚀.
    pub erode_iters: u32,

    /// 合成图中 area 层的不透明度 (0 - 255).
    pub blend_alpha: u8,

    /// ROI 轮廓的高亮颜色.
    pub highlight: [u8; 3],
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            erode_iters: DEFAULT_BOUNDARY_ERODE_ITERS,
            blend_alpha: DEFAULT_BLEND_ALPHA,
            highlight: rgb::BOUNDARY_HIGHLIGHT,
        }
    }
}

/// 三张输出文件的最终路径.
#[derive(Debug, Clone)]
pub struct OverlayPaths {
    /// 区域着色图.
    pub area: PathBuf,

    /// ROI 轮廓图.
    pub boundary: PathBuf,

    /// 原图与区域着色图的 alpha 混合图.
    pub composite: PathBuf,
}

/// 叠加绘制画布.
#[derive(Debug, Clone)]
pub struct OverlayCanvas {
    area: RgbImage,
    boundary: RgbImage,
}

impl OverlayCanvas {
    /// 以切片图像为基准初始化: area 图为全黑, boundary 图为原图副本.
    pub fn new(section: &SectionImage) -> Self {
        let (w, h) = (section.rgb.width(), section.rgb.height());
        Self {
            area: RgbImage::new(w, h),
            boundary: section.rgb.clone(),
        }
    }

    /// area 图的当前内容.
    #[inline]
    pub fn area(&self) -> &RgbImage {
        &self.area
    }

    /// boundary 图的当前内容.
    #[inline]
    pub fn boundary(&self) -> &RgbImage {
        &self.boundary
    }

    /// 将 mask 的前景像素以 `color` 填充到 area 图上.
    ///
    /// 后画的结构覆盖先画的: 按祖先深度升序逐结构调用,
    /// 即可保证子结构颜色覆盖父结构.
    pub fn paint_area(&mut self, mask: &Mask2d, color: [u8; 3]) {
        for (r, c) in mask.pos_iter() {
            self.area.put_pixel(c as u32, r as u32, Rgb(color));
        }
    }

    /// 在 boundary 图上以高亮颜色描绘 mask 的形态学轮廓.
    ///
    /// 仅应对 ROI 调用. 空 mask 不绘制任何像素.
    pub fn draw_boundary(&mut self, mask: &Mask2d, style: &OverlayStyle) {
        for (r, c) in mask.boundary(style.erode_iters).pos_iter() {
            self.boundary.put_pixel(c as u32, r as u32, Rgb(style.highlight));
        }
    }

    /// 合成原图与 area 图的整幅 alpha 混合:
    /// `out = (src * (255 - alpha) + area * alpha) / 255`.
    ///
    /// 纯整数运算, 相同输入的输出逐字节一致.
    pub fn composite(&self, section: &SectionImage, style: &OverlayStyle) -> RgbImage {
        let alpha = u16::from(style.blend_alpha);
        let inv = 255 - alpha;

        let mut out = RgbImage::new(section.rgb.width(), section.rgb.height());
        for (dst, src, top) in izip!(out.pixels_mut(), section.rgb.pixels(), self.area.pixels()) {
            for ch in 0..3 {
                dst.0[ch] =
                    ((u16::from(src.0[ch]) * inv + u16::from(top.0[ch]) * alpha) / 255) as u8;
            }
        }
        out
    }

    /// 将 area / boundary / color_composite 三张图原子地写入 `dir`.
    ///
    /// 先全部编码到 `.tmp.*` 临时文件, 三者都成功后再统一重命名到
    /// 最终文件名; 任何一步失败都会清理临时文件并返回 `Err`,
    /// 不会留下部分输出.
    pub fn save_all<P: AsRef<Path>>(
        &self,
        dir: P,
        section: &SectionImage,
        style: &OverlayStyle,
    ) -> Result<OverlayPaths, SaveError> {
        let dir = dir.as_ref();
        let composite = self.composite(section, style);

        let stage = [
            ("area.png", &self.area),
            ("boundary.png", &self.boundary),
            ("color_composite.png", &composite),
        ];

        let tmp_path = |name: &str| dir.join(format!(".tmp.{name}"));
        let cleanup = |upto: usize| {
            for (name, _) in stage.iter().take(upto) {
                let _ = fs::remove_file(tmp_path(name));
            }
        };

        for (i, (name, img)) in stage.iter().enumerate() {
            if let Err(e) = img.save_with_format(tmp_path(name), ImageFormat::Png) {
                cleanup(i + 1);
                return Err(SaveError::Image(e));
            }
        }
        for (name, _) in stage.iter() {
            if let Err(e) = fs::rename(tmp_path(name), dir.join(name)) {
                // 已重命名的无法撤回, 但剩余临时文件要清理.
                cleanup(stage.len());
                return Err(SaveError::Io(e));
            }
        }

        Ok(OverlayPaths {
            area: dir.join("area.png"),
            boundary: dir.join("boundary.png"),
            composite: dir.join("color_composite.png"),
        })
    }
}
