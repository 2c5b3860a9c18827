//! A reduced Gmsh ASCII 2.2 mesh reader/writer.
//!
//! Solver output meshes carry far more than this core needs — full
//! geometry, entity grouping, multiple element types. This reader keeps
//! node coordinates and per-element physical tags (enough to crop by tag)
//! and treats `$ElementData`/`$NodeData` blocks as named field tables, which
//! is all the post-processing pipeline (crop, compute TI, attach a new
//! field, write back) touches.

use crate::error::{TiError, TiResult};
use ndarray::Array2;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Mesh {
    pub node_ids: Vec<u64>,
    pub node_coords: Array2<f64>,
    pub element_ids: Vec<u64>,
    pub element_types: Vec<u32>,
    pub element_tags: Vec<i32>,
    pub element_node_ids: Vec<Vec<u64>>,
    pub element_fields: HashMap<String, Array2<f64>>,
    pub node_fields: HashMap<String, Array2<f64>>,
}

impl Mesh {
    pub fn read_msh(path: &Path) -> TiResult<Mesh> {
        let file = std::fs::File::open(path).map_err(|e| TiError::io(path, e))?;
        let reader = BufReader::new(file);
        let lines: Vec<String> = reader
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| TiError::io(path, e))?;

        let mut node_ids = Vec::new();
        let mut node_coords = Vec::new();
        let mut element_ids = Vec::new();
        let mut element_types = Vec::new();
        let mut element_tags = Vec::new();
        let mut element_node_ids = Vec::new();
        let mut element_fields = HashMap::new();
        let mut node_fields = HashMap::new();

        let mut i = 0usize;
        while i < lines.len() {
            let line = lines[i].trim();
            match line {
                "$Nodes" => {
                    i += 1;
                    let count: usize = lines[i].trim().parse().unwrap_or(0);
                    i += 1;
                    for _ in 0..count {
                        let parts: Vec<&str> = lines[i].split_whitespace().collect();
                        if parts.len() >= 4 {
                            node_ids.push(parts[0].parse().unwrap_or(0));
                            node_coords.push(parts[1].parse::<f64>().unwrap_or(0.0));
                            node_coords.push(parts[2].parse::<f64>().unwrap_or(0.0));
                            node_coords.push(parts[3].parse::<f64>().unwrap_or(0.0));
                        }
                        i += 1;
                    }
                }
                "$Elements" => {
                    i += 1;
                    let count: usize = lines[i].trim().parse().unwrap_or(0);
                    i += 1;
                    for _ in 0..count {
                        let parts: Vec<&str> = lines[i].split_whitespace().collect();
                        if parts.len() >= 3 {
                            let elm_id: u64 = parts[0].parse().unwrap_or(0);
                            let elm_type: u32 = parts[1].parse().unwrap_or(0);
                            let num_tags: usize = parts[2].parse().unwrap_or(0);
                            let physical_tag: i32 =
                                parts.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
                            let node_start = 3 + num_tags;
                            let nodes: Vec<u64> = parts[node_start.min(parts.len())..]
                                .iter()
                                .filter_map(|s| s.parse().ok())
                                .collect();
                            element_ids.push(elm_id);
                            element_types.push(elm_type);
                            element_tags.push(physical_tag);
                            element_node_ids.push(nodes);
                        }
                        i += 1;
                    }
                }
                "$ElementData" => {
                    let (name, data, consumed) = read_data_block(&lines, i, element_ids.len());
                    element_fields.insert(name, data);
                    i += consumed;
                    continue;
                }
                "$NodeData" => {
                    let (name, data, consumed) = read_data_block(&lines, i, node_ids.len());
                    node_fields.insert(name, data);
                    i += consumed;
                    continue;
                }
                _ => {}
            }
            i += 1;
        }

        let n_nodes = node_ids.len();
        let node_coords = Array2::from_shape_vec((n_nodes, 3), node_coords)
            .map_err(|e| TiError::Postprocess(format!("malformed node block in {path:?}: {e}")))?;

        Ok(Mesh {
            node_ids,
            node_coords,
            element_ids,
            element_types,
            element_tags,
            element_node_ids,
            element_fields,
            node_fields,
        })
    }

    pub fn write_msh(&self, path: &Path) -> TiResult<()> {
        let mut out = std::fs::File::create(path).map_err(|e| TiError::io(path, e))?;
        writeln!(out, "$MeshFormat").map_err(|e| TiError::io(path, e))?;
        writeln!(out, "2.2 0 8").map_err(|e| TiError::io(path, e))?;
        writeln!(out, "$EndMeshFormat").map_err(|e| TiError::io(path, e))?;

        writeln!(out, "$Nodes").map_err(|e| TiError::io(path, e))?;
        writeln!(out, "{}", self.node_ids.len()).map_err(|e| TiError::io(path, e))?;
        for (idx, id) in self.node_ids.iter().enumerate() {
            writeln!(
                out,
                "{} {} {} {}",
                id,
                self.node_coords[[idx, 0]],
                self.node_coords[[idx, 1]],
                self.node_coords[[idx, 2]]
            )
            .map_err(|e| TiError::io(path, e))?;
        }
        writeln!(out, "$EndNodes").map_err(|e| TiError::io(path, e))?;

        writeln!(out, "$Elements").map_err(|e| TiError::io(path, e))?;
        writeln!(out, "{}", self.element_ids.len()).map_err(|e| TiError::io(path, e))?;
        for idx in 0..self.element_ids.len() {
            let nodes: Vec<String> = self.element_node_ids[idx].iter().map(|n| n.to_string()).collect();
            writeln!(
                out,
                "{} {} 2 {} {} {}",
                self.element_ids[idx],
                self.element_types[idx],
                self.element_tags[idx],
                self.element_tags[idx],
                nodes.join(" ")
            )
            .map_err(|e| TiError::io(path, e))?;
        }
        writeln!(out, "$EndElements").map_err(|e| TiError::io(path, e))?;

        for (name, data) in &self.element_fields {
            write_data_block(&mut out, path, "$ElementData", name, &self.element_ids, data)?;
        }
        for (name, data) in &self.node_fields {
            write_data_block(&mut out, path, "$NodeData", name, &self.node_ids, data)?;
        }

        Ok(())
    }

    /// Keeps only elements whose physical tag is in `tags_keep`, along with
    /// their field rows. Nodes are kept as-is (cropping only drops elements).
    pub fn crop_mesh(&self, tags_keep: &[i32]) -> Mesh {
        let keep: Vec<usize> = self
            .element_tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| tags_keep.contains(tag))
            .map(|(idx, _)| idx)
            .collect();

        let element_ids = keep.iter().map(|&i| self.element_ids[i]).collect();
        let element_types = keep.iter().map(|&i| self.element_types[i]).collect();
        let element_tags = keep.iter().map(|&i| self.element_tags[i]).collect();
        let element_node_ids = keep.iter().map(|&i| self.element_node_ids[i].clone()).collect();

        let element_fields = self
            .element_fields
            .iter()
            .map(|(name, data)| (name.clone(), select_rows(data, &keep)))
            .collect();

        Mesh {
            node_ids: self.node_ids.clone(),
            node_coords: self.node_coords.clone(),
            element_ids,
            element_types,
            element_tags,
            element_node_ids,
            element_fields,
            node_fields: self.node_fields.clone(),
        }
    }

    pub fn add_element_field(&mut self, name: impl Into<String>, data: Array2<f64>) {
        self.element_fields.insert(name.into(), data);
    }

    pub fn add_node_field(&mut self, name: impl Into<String>, data: Array2<f64>) {
        self.node_fields.insert(name.into(), data);
    }

    /// Writes a companion Gmsh `.opt` view-options file recording which
    /// physical tags and fields should be visible when the mesh is opened.
    pub fn write_opt(&self, path: &Path, visible_tags: &[i32], visible_fields: &[&str]) -> TiResult<()> {
        let mut out = std::fs::File::create(path).map_err(|e| TiError::io(path, e))?;
        writeln!(out, "// generated view options").map_err(|e| TiError::io(path, e))?;
        writeln!(
            out,
            "General.Visible = {{{}}};",
            visible_tags
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
        .map_err(|e| TiError::io(path, e))?;
        for (idx, field) in visible_fields.iter().enumerate() {
            writeln!(out, "View[{idx}].Name = \"{field}\";").map_err(|e| TiError::io(path, e))?;
            writeln!(out, "View[{idx}].Visible = 1;").map_err(|e| TiError::io(path, e))?;
        }
        Ok(())
    }
}

fn select_rows(data: &Array2<f64>, keep: &[usize]) -> Array2<f64> {
    let ncols = data.ncols();
    let mut out = Array2::<f64>::zeros((keep.len(), ncols));
    for (dst, &src) in keep.iter().enumerate() {
        out.row_mut(dst).assign(&data.row(src));
    }
    out
}

fn read_data_block(lines: &[String], start: usize, expected_rows: usize) -> (String, Array2<f64>, usize) {
    let mut i = start + 1;
    let num_string_tags: usize = lines[i].trim().parse().unwrap_or(1);
    i += 1;
    let mut name = String::new();
    for _ in 0..num_string_tags {
        if name.is_empty() {
            name = lines[i].trim().trim_matches('"').to_string();
        }
        i += 1;
    }
    let num_real_tags: usize = lines[i].trim().parse().unwrap_or(0);
    i += 1 + num_real_tags;
    let num_int_tags: usize = lines[i].trim().parse().unwrap_or(0);
    i += 1;
    let mut num_components = 3;
    let mut num_rows = expected_rows;
    for tag_idx in 0..num_int_tags {
        let value: i64 = lines[i].trim().parse().unwrap_or(0);
        if tag_idx == 1 {
            num_components = value as usize;
        }
        if tag_idx == 2 {
            num_rows = value as usize;
        }
        i += 1;
    }

    let mut data = Vec::with_capacity(num_rows * num_components);
    for _ in 0..num_rows {
        let parts: Vec<&str> = lines[i].split_whitespace().collect();
        for v in parts.iter().skip(1) {
            data.push(v.parse::<f64>().unwrap_or(0.0));
        }
        i += 1;
    }
    // skip the $EndElementData / $EndNodeData line
    i += 1;

    let rows = if num_components > 0 { data.len() / num_components } else { 0 };
    let array = Array2::from_shape_vec((rows, num_components), data).unwrap_or_else(|_| Array2::zeros((0, num_components)));
    (name, array, i - start)
}

fn write_data_block(
    out: &mut std::fs::File,
    path: &Path,
    tag: &str,
    name: &str,
    ids: &[u64],
    data: &Array2<f64>,
) -> TiResult<()> {
    let end_tag = format!("$End{}", &tag[1..]);
    writeln!(out, "{tag}").map_err(|e| TiError::io(path, e))?;
    writeln!(out, "1").map_err(|e| TiError::io(path, e))?;
    writeln!(out, "\"{name}\"").map_err(|e| TiError::io(path, e))?;
    writeln!(out, "1\n0.0").map_err(|e| TiError::io(path, e))?;
    writeln!(out, "3\n0\n{}\n{}", data.ncols(), ids.len()).map_err(|e| TiError::io(path, e))?;
    for (row, id) in ids.iter().enumerate() {
        let values: Vec<String> = (0..data.ncols()).map(|c| data[[row, c]].to_string()).collect();
        writeln!(out, "{id} {}", values.join(" ")).map_err(|e| TiError::io(path, e))?;
    }
    writeln!(out, "{end_tag}").map_err(|e| TiError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn sample_mesh() -> Mesh {
        let mut fields = HashMap::new();
        fields.insert("E".to_string(), array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        Mesh {
            node_ids: vec![1, 2, 3],
            node_coords: array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            element_ids: vec![1, 2],
            element_types: vec![2, 2],
            element_tags: vec![2, 1],
            element_node_ids: vec![vec![1, 2, 3], vec![1, 2, 3]],
            element_fields: fields,
            node_fields: HashMap::new(),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.msh");
        let mesh = sample_mesh();
        mesh.write_msh(&path).unwrap();
        let loaded = Mesh::read_msh(&path).unwrap();
        assert_eq!(loaded.element_tags, mesh.element_tags);
        assert_eq!(loaded.node_ids, mesh.node_ids);
        assert_eq!(loaded.element_fields["E"], mesh.element_fields["E"]);
    }

    #[test]
    fn crop_keeps_only_matching_tags() {
        let mesh = sample_mesh();
        let cropped = mesh.crop_mesh(&[2]);
        assert_eq!(cropped.element_tags, vec![2]);
        assert_eq!(cropped.element_fields["E"].nrows(), 1);
    }
}
