//! VTU/PVTU export of the local leaves.
//!
//! Each rank writes its leaves as an unstructured-grid piece named
//! `s<NNNN>-p<NNNN>-<name>.vtu` (`s` counts ranks, `p` is the writing
//! rank); rank zero additionally writes the `s<NNNN>-<name>.pvtu` master
//! manifest tying the pieces together.

use std::io::Write;

use vtkio::model::*;

use crate::constants::Dim;
use crate::map::DomainMapper;
use crate::tree::LocalTree;

const CELL_DATA_NAME: &str = "cell_data";

fn piece_name(size: usize, rank: usize, name: &str) -> String {
    format!("s{:04}-p{:04}-{}.vtu", size, rank, name)
}

/// Write the local piece, plus the master manifest on rank zero. The tree's
/// connectivity must be up to date.
pub(crate) fn write(
    tree: &LocalTree,
    map: &DomainMapper,
    rank: usize,
    size: usize,
    name: &str,
    cell_data: Option<&[f64]>,
) -> std::io::Result<()> {
    let nnodes = tree.dim().nnodes();
    let ncells = tree.num_octants();
    debug_assert_eq!(tree.connectivity.len(), ncells * nnodes);

    let mut points = Vec::<f64>::with_capacity(3 * tree.nodes.len());
    for node in &tree.nodes {
        let p = map.map_point([node[0] as f64, node[1] as f64, node[2] as f64]);
        points.extend_from_slice(&p);
    }

    let connectivity: Vec<u64> = tree.connectivity.iter().map(|&id| id as u64).collect();
    let offsets: Vec<u64> = (1..=ncells as u64).map(|i| i * nnodes as u64).collect();

    // Z-ordered corners are exactly the VTK pixel/voxel orderings.
    let cell_type = match tree.dim() {
        Dim::Two => CellType::Pixel,
        Dim::Three => CellType::Voxel,
    };

    let cell_attributes = match cell_data {
        Some(values) => {
            debug_assert_eq!(values.len(), ncells);
            vec![Attribute::scalars(CELL_DATA_NAME, 1).with_data(values.to_vec())]
        }
        None => Vec::new(),
    };

    let vtk_file = Vtk {
        version: Version::new((1, 0)),
        title: String::new(),
        byte_order: ByteOrder::LittleEndian,
        file_path: None,
        data: DataSet::inline(UnstructuredGridPiece {
            points: IOBuffer::F64(points),
            cells: Cells {
                cell_verts: VertexNumbers::XML {
                    connectivity,
                    offsets,
                },
                types: vec![cell_type; ncells],
            },
            data: Attributes {
                point: vec![],
                cell: cell_attributes,
            },
        }),
    };

    vtk_file
        .export(piece_name(size, rank, name))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    if rank == 0 {
        write_master(size, name, cell_data.is_some())?;
    }
    Ok(())
}

/// The PVTU manifest is a small piece index; it is assembled directly.
fn write_master(size: usize, name: &str, with_cell_data: bool) -> std::io::Result<()> {
    let mut f = std::fs::File::create(format!("s{:04}-{}.pvtu", size, name))?;
    writeln!(f, r#"<?xml version="1.0"?>"#)?;
    writeln!(
        f,
        r#"<VTKFile type="PUnstructuredGrid" version="1.0" byte_order="LittleEndian">"#
    )?;
    writeln!(f, r#"  <PUnstructuredGrid GhostLevel="0">"#)?;
    writeln!(f, r#"    <PPoints>"#)?;
    writeln!(
        f,
        r#"      <PDataArray type="Float64" NumberOfComponents="3"/>"#
    )?;
    writeln!(f, r#"    </PPoints>"#)?;
    if with_cell_data {
        writeln!(f, r#"    <PCellData Scalars="{CELL_DATA_NAME}">"#)?;
        writeln!(
            f,
            r#"      <PDataArray type="Float64" Name="{CELL_DATA_NAME}"/>"#
        )?;
        writeln!(f, r#"    </PCellData>"#)?;
    }
    for rank in 0..size {
        writeln!(f, r#"    <Piece Source="{}"/>"#, piece_name(size, rank, name))?;
    }
    writeln!(f, r#"  </PUnstructuredGrid>"#)?;
    writeln!(f, r#"</VTKFile>"#)?;
    Ok(())
}
