// GB28181 云台控制字编码
// 8 字节: A5 0F 01 00 | 方向 | 水平速度 | 垂直速度 | 变倍/焦点/光圈

use vigil_core::{PresetCommand, PtzDirection, Result, VigilError};

/// 方向位，可按位或组合
const DIR_UP: u8 = 0x08;
const DIR_DOWN: u8 = 0x04;
const DIR_LEFT: u8 = 0x02;
const DIR_RIGHT: u8 = 0x01;
const ZOOM_IN: u8 = 0x10;
const ZOOM_OUT: u8 = 0x20;

/// 第 8 字节高半字节的镜头操作码。
/// 参考实现中 iris-close 与 focus 档位撞在 0x4n，这里给 iris-close
/// 分配独立的 0xC 档（见 DESIGN.md 的开放问题决议）
const LENS_ZOOM_IN: u8 = 0x1;
const LENS_ZOOM_OUT: u8 = 0x2;
const LENS_IRIS_OPEN: u8 = 0x3;
const LENS_FOCUS_NEAR: u8 = 0x4;
const LENS_FOCUS_FAR: u8 = 0x8;
const LENS_IRIS_CLOSE: u8 = 0xC;

fn direction_bits(direction: PtzDirection) -> u8 {
    match direction {
        PtzDirection::Up => DIR_UP,
        PtzDirection::Down => DIR_DOWN,
        PtzDirection::Left => DIR_LEFT,
        PtzDirection::Right => DIR_RIGHT,
        PtzDirection::UpLeft => DIR_UP | DIR_LEFT,
        PtzDirection::UpRight => DIR_UP | DIR_RIGHT,
        PtzDirection::DownLeft => DIR_DOWN | DIR_LEFT,
        PtzDirection::DownRight => DIR_DOWN | DIR_RIGHT,
        PtzDirection::ZoomIn => ZOOM_IN,
        PtzDirection::ZoomOut => ZOOM_OUT,
        _ => 0x00,
    }
}

fn lens_nibble(direction: PtzDirection) -> u8 {
    match direction {
        PtzDirection::ZoomIn => LENS_ZOOM_IN,
        PtzDirection::ZoomOut => LENS_ZOOM_OUT,
        PtzDirection::FocusNear => LENS_FOCUS_NEAR,
        PtzDirection::FocusFar => LENS_FOCUS_FAR,
        PtzDirection::IrisOpen => LENS_IRIS_OPEN,
        PtzDirection::IrisClose => LENS_IRIS_CLOSE,
        _ => 0,
    }
}

/// 编码方向/变倍控制字
pub fn encode_control(
    direction: PtzDirection,
    speed: u8,
    horizontal: u8,
    vertical: u8,
    zoom: u8,
) -> [u8; 8] {
    let mut cmd = [0xA5, 0x0F, 0x01, 0x00, 0, 0, 0, 0];
    cmd[4] = direction_bits(direction);

    cmd[5] = if horizontal > 0 { horizontal } else { speed };
    cmd[6] = if vertical > 0 { vertical } else { speed };

    let zoom_speed = if zoom > 0 { zoom & 0x0F } else { speed & 0x0F };
    cmd[7] = (lens_nibble(direction) << 4) | zoom_speed;
    cmd
}

/// 编码预置位控制字：操作码在第 8 字节，预置位号在第 7 字节
pub fn encode_preset(command: PresetCommand, preset_id: u8) -> Result<[u8; 8]> {
    if preset_id == 0 {
        return Err(VigilError::InvalidInput(
            "preset id must be between 1 and 255".into(),
        ));
    }
    let op = match command {
        PresetCommand::SetPreset => 0x81,
        PresetCommand::GotoPreset => 0x82,
        PresetCommand::RemovePreset => 0x83,
    };
    Ok([0xA5, 0x0F, 0x01, 0x00, 0x00, 0x00, preset_id, op])
}

/// 控制字转大写十六进制串（XML PTZCmd 字段格式）
pub fn to_hex(cmd: &[u8; 8]) -> String {
    cmd.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_table_bit_exact() {
        assert_eq!(encode_control(PtzDirection::Up, 0x7F, 0, 0, 0)[4], 0x08);
        assert_eq!(encode_control(PtzDirection::Down, 0x7F, 0, 0, 0)[4], 0x04);
        assert_eq!(encode_control(PtzDirection::Left, 0x7F, 0, 0, 0)[4], 0x02);
        assert_eq!(encode_control(PtzDirection::Right, 0x7F, 0, 0, 0)[4], 0x01);
        assert_eq!(encode_control(PtzDirection::UpLeft, 0x7F, 0, 0, 0)[4], 0x0A);
        assert_eq!(encode_control(PtzDirection::UpRight, 0x7F, 0, 0, 0)[4], 0x09);
        assert_eq!(encode_control(PtzDirection::DownLeft, 0x7F, 0, 0, 0)[4], 0x06);
        assert_eq!(encode_control(PtzDirection::DownRight, 0x7F, 0, 0, 0)[4], 0x05);
        assert_eq!(encode_control(PtzDirection::ZoomIn, 0x7F, 0, 0, 0)[4], 0x10);
        assert_eq!(encode_control(PtzDirection::ZoomOut, 0x7F, 0, 0, 0)[4], 0x20);
        assert_eq!(encode_control(PtzDirection::Stop, 0, 0, 0, 0)[4], 0x00);
    }

    #[test]
    fn test_header_and_speeds() {
        let cmd = encode_control(PtzDirection::UpRight, 0x50, 0xA0, 0xB0, 5);
        assert_eq!(&cmd[..4], &[0xA5, 0x0F, 0x01, 0x00]);
        assert_eq!(cmd[5], 0xA0);
        assert_eq!(cmd[6], 0xB0);
        assert_eq!(cmd[7] & 0x0F, 5);

        // 未提供独立速度时退回统一速度
        let cmd = encode_control(PtzDirection::Left, 0x50, 0, 0, 0);
        assert_eq!(cmd[5], 0x50);
        assert_eq!(cmd[6], 0x50);
    }

    #[test]
    fn test_lens_nibbles_distinct() {
        let ops = [
            (PtzDirection::ZoomIn, 0x1),
            (PtzDirection::ZoomOut, 0x2),
            (PtzDirection::IrisOpen, 0x3),
            (PtzDirection::FocusNear, 0x4),
            (PtzDirection::FocusFar, 0x8),
            (PtzDirection::IrisClose, 0xC),
        ];
        for (dir, nibble) in ops {
            assert_eq!(encode_control(dir, 0, 0, 0, 3)[7] >> 4, nibble, "{dir:?}");
        }
        // 表内无碰撞
        let nibbles: std::collections::HashSet<u8> =
            ops.iter().map(|(d, _)| encode_control(*d, 0, 0, 0, 0)[7] >> 4).collect();
        assert_eq!(nibbles.len(), ops.len());
    }

    #[test]
    fn test_preset_encoding() {
        let set = encode_preset(PresetCommand::SetPreset, 12).unwrap();
        assert_eq!(set[7], 0x81);
        assert_eq!(set[6], 12);
        assert_eq!(encode_preset(PresetCommand::GotoPreset, 1).unwrap()[7], 0x82);
        assert_eq!(encode_preset(PresetCommand::RemovePreset, 255).unwrap()[7], 0x83);
        assert!(encode_preset(PresetCommand::SetPreset, 0).is_err());
    }

    #[test]
    fn test_hex_rendering() {
        let cmd = encode_control(PtzDirection::Up, 0x0F, 0, 0, 0);
        assert_eq!(to_hex(&cmd), "A50F0100080F0F0F");
    }
}
