//! 结构本体 (ontology) 查询.
//!
//! 本体是一棵以 root (全脑) 为根的解剖区域树. 每个结构拥有唯一 id,
//! 一个 acronym, 一个展示颜色, 以及从根到自身的祖先链. 该模块只读,
//! 从 JSON 文件一次性加载.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde::Deserialize;

/// 本体查询错误.
#[derive(Debug)]
pub enum LookupError {
    /// 请求的 acronym 在本体树中不存在.
    UnknownAcronym(String),

    /// 请求的结构 id 在本体树中不存在.
    UnknownId(u32),

    /// 颜色字段不是合法的 6 位十六进制 RGB.
    BadColor(String),

    /// JSON 解析错误.
    Json(serde_json::Error),

    /// 底层 I/O 错误.
    Io(io::Error),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAcronym(a) => write!(f, "本体树中不存在 acronym `{a}`"),
            Self::UnknownId(id) => write!(f, "本体树中不存在结构 id {id}"),
            Self::BadColor(s) => write!(f, "非法的颜色字段 `{s}`, 期望 6 位十六进制"),
            Self::Json(e) => write!(f, "本体 JSON 解析失败: {e}"),
            Self::Io(e) => write!(f, "本体文件读取失败: {e}"),
        }
    }
}

impl std::error::Error for LookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LookupError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<io::Error> for LookupError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// 单个解剖结构的元信息.
#[derive(Debug, Clone)]
pub struct Structure {
    /// 结构唯一 id.
    pub id: u32,

    /// 结构缩写, 如 "LP", "APN".
    pub acronym: String,

    /// 结构全名.
    pub name: String,

    /// 展示颜色.
    pub rgb: [u8; 3],

    /// 从根到自身 (含) 的祖先链.
    pub path: Vec<u32>,
}

impl Structure {
    /// 该结构在本体树中的深度. 根结构的深度为 1.
    #[inline]
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// `ancestor` 是否在该结构的祖先链上? 自身视作自己的祖先.
    #[inline]
    pub fn descends_from(&self, ancestor: u32) -> bool {
        self.path.contains(&ancestor)
    }
}

/// 本体 JSON 中的原始记录. 字段命名与上游序列化格式保持一致.
#[derive(Debug, Deserialize)]
struct RawStructure {
    id: u32,
    acronym: String,
    name: String,
    color_hex_triplet: String,
    structure_id_path: Vec<u32>,
}

/// 解析 `"188064"` 形式的十六进制 RGB.
fn parse_hex_rgb(s: &str) -> Result<[u8; 3], LookupError> {
    let bad = || LookupError::BadColor(s.to_owned());
    if s.len() != 6 || !s.is_ascii() {
        return Err(bad());
    }
    let channel = |range| u8::from_str_radix(&s[range], 16).map_err(|_| bad());
    Ok([channel(0..2)?, channel(2..4)?, channel(4..6)?])
}

/// 只读的结构本体树.
///
/// 按 id 与 acronym 两种键提供查询. 构建后不可修改.
#[derive(Debug, Clone)]
pub struct StructureTree {
    nodes: HashMap<u32, Structure>,
    by_acronym: HashMap<String, u32>,
}

impl StructureTree {
    /// 从 JSON 文件加载本体树. `path` 为本地路径.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LookupError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }

    /// 从任意 `Read` 加载本体树. 输入必须是 `RawStructure` 记录组成的 JSON 数组.
    pub fn from_reader<R: Read>(r: R) -> Result<Self, LookupError> {
        let raw: Vec<RawStructure> = serde_json::from_reader(r)?;
        let mut nodes = HashMap::with_capacity(raw.len());
        let mut by_acronym = HashMap::with_capacity(raw.len());
        for rec in raw {
            let rgb = parse_hex_rgb(&rec.color_hex_triplet)?;
            by_acronym.insert(rec.acronym.clone(), rec.id);
            nodes.insert(
                rec.id,
                Structure {
                    id: rec.id,
                    acronym: rec.acronym,
                    name: rec.name,
                    rgb,
                    path: rec.structure_id_path,
                },
            );
        }
        Ok(Self { nodes, by_acronym })
    }

    /// 直接由结构集合构建本体树.
    ///
    /// # 注意
    ///
    /// 各 `Structure` 的祖先链一致性由调用方保证, 否则查询结果可能不自洽.
    /// 你应仅将其用于实验目的.
    pub fn fake<I: IntoIterator<Item = Structure>>(it: I) -> Self {
        let mut nodes = HashMap::new();
        let mut by_acronym = HashMap::new();
        for s in it {
            by_acronym.insert(s.acronym.clone(), s.id);
            nodes.insert(s.id, s);
        }
        Self { nodes, by_acronym }
    }

    /// 本体树中的结构个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 本体树是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 按 id 查询结构. 不存在时返回 `None`.
    #[inline]
    pub fn get(&self, id: u32) -> Option<&Structure> {
        self.nodes.get(&id)
    }

    /// 按 id 查询结构. 不存在时返回 `Err`.
    #[inline]
    pub fn require(&self, id: u32) -> Result<&Structure, LookupError> {
        self.get(id).ok_or(LookupError::UnknownId(id))
    }

    /// 按 acronym 查询结构 id. 不存在时返回 `Err`.
    pub fn id_by_acronym(&self, acronym: &str) -> Result<u32, LookupError> {
        self.by_acronym
            .get(acronym)
            .copied()
            .ok_or_else(|| LookupError::UnknownAcronym(acronym.to_owned()))
    }

    /// 将一组 acronym 解析为结构 id. 任一缺失即返回 `Err`, 顺序与输入一致.
    pub fn resolve_acronyms<S: AsRef<str>>(&self, acronyms: &[S]) -> Result<Vec<u32>, LookupError> {
        acronyms
            .iter()
            .map(|a| self.id_by_acronym(a.as_ref()))
            .collect()
    }

    /// 结构在树中的深度 (祖先链长度). id 不存在时返回 `None`.
    #[inline]
    pub fn depth(&self, id: u32) -> Option<usize> {
        self.get(id).map(Structure::depth)
    }

    /// 收集 `id` 及其全部后代的 id.
    ///
    /// 若 `id` 不在树中则返回空 `Vec`.
    pub fn descendant_ids(&self, id: u32) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|s| s.descends_from(id))
            .map(|s| s.id)
            .collect()
    }

    /// 结构的展示颜色. id 缺失或本体无颜色信息时回退为白色.
    #[inline]
    pub fn color_of(&self, id: u32) -> [u8; 3] {
        self.get(id).map_or(crate::consts::rgb::WHITE, |s| s.rgb)
    }
}
