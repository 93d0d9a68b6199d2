//! 逐结构栅格化: 3D 结构 mask -> 目标切片上的 2D 二值区域.

use std::collections::{HashSet, VecDeque};

use ndarray::{Array2, ArrayView2};

use crate::annot::AnnotVolume;
use crate::section::{on_section, ImageGeom};
use crate::warp::{transform_voxel, Affine3, DisplacementField};
use crate::Idx2d;

/// 参考体数据到目标切片像素空间的一组映射参数.
#[derive(Debug, Clone, Copy)]
pub struct SliceMapping {
    /// annotation 体素分辨率, 单位为微米.
    pub resolution_um: f64,

    /// 相邻切片间距, 单位为微米.
    pub spacing_um: f64,

    /// 目标切片索引.
    pub section_index: i64,

    /// 图像投影几何.
    pub geom: ImageGeom,
}

/// 与切片图像等大的 0/1 画布.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask2d {
    data: Array2<u8>,
}

impl Mask2d {
    /// 创建全零画布. `shape` 按 (高, 宽) 给出.
    #[inline]
    pub fn zeros(shape: Idx2d) -> Self {
        Self {
            data: Array2::zeros(shape),
        }
    }

    /// 画布的分辨率 (高, 宽).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        let &[h, w] = self.data.shape() else {
            unreachable!()
        };
        (h, w)
    }

    /// 获得底层数据的一份不可变 shallow copy.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, u8> {
        self.data.view()
    }

    /// 给定位置是否为前景? 越界按背景处理.
    #[inline]
    pub fn is_set(&self, pos: Idx2d) -> bool {
        self.data.get(pos).is_some_and(|&p| p != 0)
    }

    /// 将给定位置设置为前景. 越界时 panic.
    #[inline]
    pub fn set(&mut self, pos: Idx2d) {
        self.data[pos] = 1;
    }

    /// 前景像素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|p| **p != 0).count()
    }

    /// 画布是否为全背景?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&p| p == 0)
    }

    /// `inner` 的前景是否全部落在 `self` 的前景内 (`inner` ⊆ `self`)?
    ///
    /// 两画布形状不一致时 panic.
    pub fn contains(&self, inner: &Mask2d) -> bool {
        assert_eq!(self.shape(), inner.shape());
        inner
            .data
            .indexed_iter()
            .all(|(pos, &p)| p == 0 || self.is_set(pos))
    }

    /// 迭代全部前景位置, 按行优先序.
    pub fn pos_iter(&self) -> impl Iterator<Item = Idx2d> + '_ {
        self.data
            .indexed_iter()
            .filter_map(|(pos, &p)| (p != 0).then_some(pos))
    }

    /// 以 `center` 为中心绘制边长 `side` 的方形 footprint.
    ///
    /// `center` 按 (行, 列) 给出, 允许为负或越界; 超出画布的部分被
    /// **静默裁剪**, 完全在画布外的 footprint 不绘制任何像素.
    pub fn paint_square(&mut self, center: (i64, i64), side: u32) {
        let (h, w) = self.shape();
        let half = i64::from(side / 2);
        let side = i64::from(side);

        let r0 = (center.0 - half).clamp(0, h as i64);
        let r1 = (center.0 - half + side).clamp(0, h as i64);
        let c0 = (center.1 - half).clamp(0, w as i64);
        let c1 = (center.1 - half + side).clamp(0, w as i64);

        for r in r0..r1 {
            for c in c0..c1 {
                self.data[(r as usize, c as usize)] = 1;
            }
        }
    }

    /// 4-邻接膨胀一次.
    pub fn dilate(&mut self) {
        let (h, w) = self.shape();
        let src = self.data.clone();
        for ((r, c), dst) in self.data.indexed_iter_mut() {
            if *dst != 0 {
                continue;
            }
            let hit = (r > 0 && src[(r - 1, c)] != 0)
                || (r + 1 < h && src[(r + 1, c)] != 0)
                || (c > 0 && src[(r, c - 1)] != 0)
                || (c + 1 < w && src[(r, c + 1)] != 0);
            if hit {
                *dst = 1;
            }
        }
    }

    /// 4-邻接腐蚀一次. 画布边界外视为背景, 因此贴边前景会被剥除,
    /// 反复腐蚀必然得到空画布 (不会 panic).
    pub fn erode(&mut self) {
        let (h, w) = self.shape();
        let src = self.data.clone();
        for ((r, c), dst) in self.data.indexed_iter_mut() {
            if *dst == 0 {
                continue;
            }
            let keep = r > 0
                && r + 1 < h
                && c > 0
                && c + 1 < w
                && src[(r - 1, c)] != 0
                && src[(r + 1, c)] != 0
                && src[(r, c - 1)] != 0
                && src[(r, c + 1)] != 0;
            if !keep {
                *dst = 0;
            }
        }
    }

    /// 形态学闭运算: 膨胀 `iters` 次后腐蚀 `iters` 次, 弥合 footprint
    /// 之间的小缝隙.
    pub fn close(&mut self, iters: u32) {
        for _ in 0..iters {
            self.dilate();
        }
        for _ in 0..iters {
            self.erode();
        }
    }

    /// 腐蚀 `iters` 次后的副本.
    pub fn eroded(&self, iters: u32) -> Mask2d {
        let mut out = self.clone();
        for _ in 0..iters {
            out.erode();
        }
        out
    }

    /// 区域轮廓: `self` 减去其 `iters` 次腐蚀. 结果必然 ⊆ `self`.
    pub fn boundary(&self, iters: u32) -> Mask2d {
        let eroded = self.eroded(iters);
        let mut out = self.clone();
        for (dst, &e) in out.data.iter_mut().zip(eroded.data.iter()) {
            if e != 0 {
                *dst = 0;
            }
        }
        out
    }

    /// 填充内部空洞: 不与画布边界 4-连通的背景区域被置为前景.
    ///
    /// 从边界背景像素出发做一次 BFS, 未被访问到的背景即空洞.
    pub fn fill_holes(&mut self) {
        let (h, w) = self.shape();
        if h == 0 || w == 0 {
            return;
        }

        let mut reachable = Array2::<u8>::zeros((h, w));
        let mut bfs_q = VecDeque::with_capacity(2 * (h + w));

        // 边界上的背景像素是 BFS 源点.
        for r in 0..h {
            for c in [0, w - 1] {
                if self.data[(r, c)] == 0 && reachable[(r, c)] == 0 {
                    reachable[(r, c)] = 1;
                    bfs_q.push_back((r, c));
                }
            }
        }
        for c in 0..w {
            for r in [0, h - 1] {
                if self.data[(r, c)] == 0 && reachable[(r, c)] == 0 {
                    reachable[(r, c)] = 1;
                    bfs_q.push_back((r, c));
                }
            }
        }

        while let Some((r, c)) = bfs_q.pop_front() {
            let mut probe = |pos: Idx2d| {
                if self.data[pos] == 0 && reachable[pos] == 0 {
                    reachable[pos] = 1;
                    bfs_q.push_back(pos);
                }
            };
            if r > 0 {
                probe((r - 1, c));
            }
            if r + 1 < h {
                probe((r + 1, c));
            }
            if c > 0 {
                probe((r, c - 1));
            }
            if c + 1 < w {
                probe((r, c + 1));
            }
        }

        for (pos, dst) in self.data.indexed_iter_mut() {
            if *dst == 0 && reachable[pos] == 0 {
                *dst = 1;
            }
        }
    }
}

/// 栅格化单个结构.
///
/// 遍历 label 属于 `ids` 的全部体素, 经位移场 + 仿射变换映射到标本物理空间,
/// 保留落在目标切片上的点, 投影到像素空间绘制方形 footprint,
/// 最后做一次闭运算并填充空洞.
///
/// 没有任何体素落在目标切片上时返回空画布, 这是合法结果而非错误.
/// 给定相同输入, 输出逐 bit 一致 (遍历为行优先定序, 无浮点归约).
pub fn rasterize_structure(
    annot: &AnnotVolume,
    ids: &HashSet<u32>,
    field: &DisplacementField,
    affine: &Affine3,
    map: &SliceMapping,
    canvas_shape: Idx2d,
) -> Mask2d {
    let mut canvas = Mask2d::zeros(canvas_shape);
    let mut landed = 0usize;

    for (pos, label) in annot.data().indexed_iter() {
        if !ids.contains(label) {
            continue;
        }
        let q = transform_voxel(field, affine, pos, map.resolution_um);
        if !on_section(q[2], map.spacing_um, map.section_index) {
            continue;
        }
        let (px, py) = map.geom.project(q[0], q[1]);
        canvas.paint_square((py, px), map.geom.footprint_px());
        landed += 1;
    }

    if landed == 0 {
        return canvas;
    }
    canvas.close(1);
    canvas.fill_holes();
    canvas
}
