// Unit tests for the ARMv6-M classifier
#[cfg(test)]
mod tests {
    use wcetan_core::analyzer::decoder;
    use wcetan_core::analyzer::decoder::ThumbOp;

    #[test]
    fn test_classify_mov_immediate() {
        // movs r0, #1
        assert_eq!(decoder::classify("2001"), ThumbOp::MovImm);
    }

    #[test]
    fn test_bl_target_round_trip() {
        // bl to self: f7ff fffe
        assert_eq!(decoder::jump_target("f7ff fffe", 0x80001000), Some(0x80001000));
    }

    #[test]
    fn test_pop_pc_is_return() {
        assert!(decoder::is_return("bd10"));
        assert!(!decoder::is_return("bc10"));
    }
}
